use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{WorkItem, WorkItemPatch, WorkStatus};
use crate::domain::ports::{WorkFilter, WorkStore};
use crate::services::dependency_resolver::detect_cycle_in_graph;

/// Queue operations for callers outside the scheduler.
///
/// Adds graph checks the store cannot make on its own: blockers that would
/// close a dependency cycle are rejected up front, since a cycle would leave
/// its members permanently unready.
pub struct WorkQueueService<S: ?Sized> {
    store: Arc<S>,
}

impl<S: WorkStore + ?Sized> WorkQueueService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Submit a new work item to the queue.
    ///
    /// # Errors
    /// - Invalid item data (empty title, self-reference)
    /// - Blockers that would close a dependency cycle
    /// - Database errors
    #[instrument(skip(self, item), fields(item_id = %item.id), err)]
    pub async fn submit(&self, item: WorkItem) -> DomainResult<Uuid> {
        item.validate()?;

        if !item.blocked_by.is_empty() {
            let blockers: Vec<Uuid> = item.blocked_by.iter().copied().collect();
            let known = self.store.statuses(&blockers).await?;
            for id in blockers.iter().filter(|id| !known.contains_key(id)) {
                warn!(blocker = %id, "blocker does not exist yet; item stays unready until it completes");
            }
            self.ensure_acyclic(item.id, &item.blocked_by).await?;
        }

        let id = self.store.add(item).await?;
        info!(item_id = %id, "work item submitted");
        Ok(id)
    }

    /// Merge a patch into an item, rejecting blocker changes that would
    /// close a cycle.
    #[instrument(skip(self, patch), err)]
    pub async fn update(&self, id: Uuid, patch: WorkItemPatch) -> DomainResult<WorkItem> {
        if let Some(blocked_by) = &patch.blocked_by {
            self.ensure_acyclic(id, blocked_by).await?;
        }
        self.store.update(id, patch).await
    }

    pub async fn get(&self, id: Uuid) -> DomainResult<WorkItem> {
        self.store
            .get(id)
            .await?
            .ok_or(DomainError::WorkItemNotFound(id))
    }

    pub async fn list(&self, filter: WorkFilter) -> DomainResult<Vec<WorkItem>> {
        self.store.list(filter).await
    }

    pub async fn hold(&self, id: Uuid, reason: &str) -> DomainResult<WorkItem> {
        self.store.hold(id, reason).await
    }

    pub async fn release(&self, id: Uuid) -> DomainResult<WorkItem> {
        self.store.release(id).await
    }

    pub async fn counts(&self) -> DomainResult<HashMap<WorkStatus, u64>> {
        self.store.count_by_status().await
    }

    /// Walk the stored graph reachable from `blocked_by` and check that it
    /// does not lead back to `id`.
    async fn ensure_acyclic(&self, id: Uuid, blocked_by: &BTreeSet<Uuid>) -> DomainResult<()> {
        let mut graph: BTreeMap<Uuid, BTreeSet<Uuid>> = BTreeMap::new();
        graph.insert(id, blocked_by.clone());

        let mut queue: VecDeque<Uuid> = blocked_by.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if graph.contains_key(&next) {
                continue;
            }
            if let Some(item) = self.store.get(next).await? {
                queue.extend(item.blocked_by.iter().copied());
                graph.insert(next, item.blocked_by);
            }
        }

        match detect_cycle_in_graph(&graph) {
            Some(cycle) => {
                warn!(item_id = %id, cycle_len = cycle.len(), "rejected dependency cycle");
                Err(DomainError::DependencyCycle(cycle))
            }
            None => Ok(()),
        }
    }
}
