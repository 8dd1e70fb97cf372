use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{WorkItem, WorkStatus};
use crate::domain::ports::{WorkFilter, WorkStore};

/// Subtask readiness over the `blocked_by` graph stored in a [`WorkStore`].
pub struct DependencyResolver<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for DependencyResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: WorkStore + ?Sized> DependencyResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// All items under `parent_id`, oldest first
    pub async fn subtasks(&self, parent_id: Uuid) -> DomainResult<Vec<WorkItem>> {
        self.store
            .list(WorkFilter {
                parent_task_id: Some(parent_id),
                ..Default::default()
            })
            .await
    }

    /// Subtasks whose blockers have all completed.
    ///
    /// Blockers that reference no existing item count as unsatisfied.
    pub async fn ready_subtasks(&self, parent_id: Uuid) -> DomainResult<Vec<WorkItem>> {
        let subtasks = self.subtasks(parent_id).await?;
        let blockers: Vec<Uuid> = subtasks
            .iter()
            .flat_map(|item| item.blocked_by.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let statuses = self.store.statuses(&blockers).await?;

        Ok(subtasks
            .into_iter()
            .filter(|item| is_ready(item, &statuses))
            .collect())
    }

    /// True iff the parent has at least one subtask and all are completed
    pub async fn all_complete(&self, parent_id: Uuid) -> DomainResult<bool> {
        let subtasks = self.subtasks(parent_id).await?;
        Ok(!subtasks.is_empty()
            && subtasks
                .iter()
                .all(|item| item.status == WorkStatus::Completed))
    }
}

/// Whether every blocker of `item` is known to be completed.
pub fn is_ready(item: &WorkItem, statuses: &HashMap<Uuid, WorkStatus>) -> bool {
    item.blocked_by
        .iter()
        .all(|id| statuses.get(id) == Some(&WorkStatus::Completed))
}

/// Find a cycle in the `blocked_by` graph formed by `items`.
///
/// Returns the closed path (first id repeated at the end). Edges to ids
/// outside `items` are ignored.
pub fn detect_cycle<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Option<Vec<Uuid>> {
    let graph: BTreeMap<Uuid, BTreeSet<Uuid>> = items
        .into_iter()
        .map(|item| (item.id, item.blocked_by.clone()))
        .collect();
    detect_cycle_in_graph(&graph)
}

/// DFS cycle search over an adjacency map, visiting nodes in id order.
pub fn detect_cycle_in_graph(graph: &BTreeMap<Uuid, BTreeSet<Uuid>>) -> Option<Vec<Uuid>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for &node in graph.keys() {
        if !visited.contains(&node)
            && detect_cycle_util(node, graph, &mut visited, &mut rec_stack, &mut path)
        {
            return Some(path);
        }
    }
    None
}

fn detect_cycle_util(
    node: Uuid,
    graph: &BTreeMap<Uuid, BTreeSet<Uuid>>,
    visited: &mut HashSet<Uuid>,
    rec_stack: &mut HashSet<Uuid>,
    path: &mut Vec<Uuid>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(&node) {
        for &neighbor in neighbors {
            if !graph.contains_key(&neighbor) {
                continue;
            }
            if !visited.contains(&neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(&neighbor) {
                if let Some(cycle_start) = path.iter().position(|&id| id == neighbor) {
                    path.drain(0..cycle_start);
                    path.push(neighbor);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_migrated_test_pool, SqliteWorkStore};
    use crate::domain::models::WorkResult;
    use std::time::Duration;

    fn item_blocked_by(blockers: &[Uuid]) -> WorkItem {
        blockers
            .iter()
            .fold(WorkItem::new("Test", "Description"), |item, &id| item.blocked_by(id))
    }

    #[test]
    fn test_is_ready_with_no_blockers() {
        let item = WorkItem::new("Free", "desc");
        assert!(is_ready(&item, &HashMap::new()));
    }

    #[test]
    fn test_is_ready_requires_completed() {
        let blocker = Uuid::new_v4();
        let item = item_blocked_by(&[blocker]);

        let mut statuses = HashMap::new();
        assert!(!is_ready(&item, &statuses));
        statuses.insert(blocker, WorkStatus::Failed);
        assert!(!is_ready(&item, &statuses));
        statuses.insert(blocker, WorkStatus::Completed);
        assert!(is_ready(&item, &statuses));
    }

    #[test]
    fn test_detect_cycle_no_cycle() {
        let a = WorkItem::new("A", "desc");
        let b = item_blocked_by(&[a.id]);
        assert!(detect_cycle([&a, &b]).is_none());
    }

    #[test]
    fn test_detect_cycle_with_cycle() {
        let mut a = WorkItem::new("A", "desc");
        let b = item_blocked_by(&[a.id]);
        a.blocked_by.insert(b.id);

        let cycle = detect_cycle([&a, &b]).unwrap();
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&a.id) && cycle.contains(&b.id));
    }

    #[test]
    fn test_detect_cycle_ignores_external_edges() {
        let outside = Uuid::new_v4();
        let a = item_blocked_by(&[outside]);
        assert!(detect_cycle([&a]).is_none());
    }

    #[tokio::test]
    async fn test_ready_subtasks_follow_blocker_completion() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = Arc::new(SqliteWorkStore::new(pool));
        let resolver = DependencyResolver::new(Arc::clone(&store));

        let parent = store.add(WorkItem::new("Parent", "desc")).await.unwrap();
        let first = store
            .add(WorkItem::new("First", "desc").with_parent(parent))
            .await
            .unwrap();
        let second = store
            .add(WorkItem::new("Second", "desc").with_parent(parent).blocked_by(first))
            .await
            .unwrap();

        let ready: Vec<Uuid> = resolver.ready_subtasks(parent).await.unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![first]);
        assert!(!resolver.all_complete(parent).await.unwrap());

        store.claim(first).await.unwrap().unwrap();
        store.complete(first, WorkResult::default(), Duration::ZERO).await.unwrap();

        let ready: Vec<Uuid> = resolver.ready_subtasks(parent).await.unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ready, vec![first, second]);

        store.claim(second).await.unwrap().unwrap();
        store.complete(second, WorkResult::default(), Duration::ZERO).await.unwrap();
        assert!(resolver.all_complete(parent).await.unwrap());
    }

    #[tokio::test]
    async fn test_all_complete_false_without_subtasks() {
        let pool = create_migrated_test_pool().await.unwrap();
        let store = Arc::new(SqliteWorkStore::new(pool));
        let resolver = DependencyResolver::new(Arc::clone(&store));

        let parent = store.add(WorkItem::new("Lonely parent", "desc")).await.unwrap();
        assert!(!resolver.all_complete(parent).await.unwrap());
    }
}
