use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{WorkItem, WorkItemPatch, WorkResult, WorkStatus};

/// Filters for listing work items
#[derive(Default, Debug, Clone)]
pub struct WorkFilter {
    pub status: Option<WorkStatus>,
    pub parent_task_id: Option<Uuid>,
    pub item_type: Option<String>,
    pub limit: Option<i64>,
}

/// Persistent priority queue and state machine for work items.
///
/// Every status-changing operation is a conditional transition: it only
/// applies when the item is in the required source state and reports
/// [`DomainError::InvalidStateTransition`](crate::domain::DomainError::InvalidStateTransition)
/// otherwise.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert a new item as `pending` with zero attempts and return its id.
    async fn add(&self, item: WorkItem) -> DomainResult<Uuid>;

    /// Get an item by id
    async fn get(&self, id: Uuid) -> DomainResult<Option<WorkItem>>;

    /// List items, oldest first
    async fn list(&self, filter: WorkFilter) -> DomainResult<Vec<WorkItem>>;

    /// Current status of each existing id; unknown ids are absent from the map
    async fn statuses(&self, ids: &[Uuid]) -> DomainResult<HashMap<Uuid, WorkStatus>>;

    /// Item count per status
    async fn count_by_status(&self) -> DomainResult<HashMap<WorkStatus, u64>>;

    /// Atomically claim the best pending item whose blockers are all completed.
    ///
    /// Lowest priority value wins, ties go to the earliest `created_at`.
    async fn claim_next(&self) -> DomainResult<Option<WorkItem>>;

    /// Atomically claim one specific pending item whose blockers are all completed.
    async fn claim(&self, id: Uuid) -> DomainResult<Option<WorkItem>>;

    /// `active → completed`
    async fn complete(
        &self,
        id: Uuid,
        result: WorkResult,
        execution_time: Duration,
    ) -> DomainResult<WorkItem>;

    /// `active → pending` while `attempts < max_retries`, else `active → failed`
    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        max_retries: u32,
        execution_time: Duration,
    ) -> DomainResult<WorkItem>;

    /// Like [`fail`](Self::fail), but an item that would be re-queued is
    /// parked on `hold` in the same transaction.
    async fn escalate(
        &self,
        id: Uuid,
        reason: &str,
        max_retries: u32,
        execution_time: Duration,
    ) -> DomainResult<WorkItem>;

    /// `pending | hold → hold`
    async fn hold(&self, id: Uuid, reason: &str) -> DomainResult<WorkItem>;

    /// `hold → pending`
    async fn release(&self, id: Uuid) -> DomainResult<WorkItem>;

    /// Merge non-status fields
    async fn update(&self, id: Uuid, patch: WorkItemPatch) -> DomainResult<WorkItem>;
}
