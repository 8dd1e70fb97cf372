//! SQLite implementation of the WorkStore.
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = ...
//! RETURNING *`. When the condition matches no row the caller gets "no item"
//! (claims) or an invalid-transition error (everything else); no transition
//! is ever decided from a value read in an earlier statement.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    duration_to_nanos, format_datetime, millis_to_duration, nanos_to_duration, parse_datetime,
    parse_json_or_default, parse_optional_datetime, parse_optional_uuid, parse_uuid,
};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Priority, WorkContext, WorkItem, WorkItemPatch, WorkResult, WorkStatus,
};
use crate::domain::ports::{WorkFilter, WorkStore};

/// Blocker check shared by both claim statements: every `blocked_by` id must
/// name an existing, completed item.
const BLOCKERS_SATISFIED: &str = "NOT EXISTS (
        SELECT 1 FROM json_each(candidate.blocked_by) AS b
        LEFT JOIN work_items AS d ON d.id = b.value
        WHERE d.id IS NULL OR d.status != 'completed'
    )";

/// Attempts allowed for a conditional update racing with other writers.
const UPDATE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SqliteWorkStore {
    pool: SqlitePool,
}

impl SqliteWorkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn require(&self, id: Uuid) -> DomainResult<WorkItem> {
        self.get(id).await?.ok_or(DomainError::WorkItemNotFound(id))
    }

    /// Explain why a conditional transition matched nothing.
    async fn transition_error(&self, id: Uuid, to: WorkStatus, required: &str) -> DomainError {
        match self.get(id).await {
            Ok(Some(item)) => DomainError::InvalidStateTransition {
                from: item.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!("item must be {required}"),
            },
            Ok(None) => DomainError::WorkItemNotFound(id),
            Err(e) => e,
        }
    }
}

fn require_status(item: &WorkItem, allowed: &[WorkStatus], to: WorkStatus) -> DomainResult<()> {
    if allowed.contains(&item.status) {
        return Ok(());
    }
    let required = allowed.iter().map(WorkStatus::as_str).collect::<Vec<_>>().join(" or ");
    Err(DomainError::InvalidStateTransition {
        from: item.status.as_str().to_string(),
        to: to.as_str().to_string(),
        reason: format!("item must be {required}"),
    })
}

/// Wall-clock time from start (or creation) until now.
fn elapsed_millis(item: &WorkItem, now: chrono::DateTime<Utc>) -> i64 {
    let start = item.started_at.unwrap_or(item.created_at);
    (now - start).num_milliseconds().max(0)
}

/// The retry-or-fail transition, shared by `fail` and `escalate`.
struct FailTransition {
    id: String,
    error: String,
    max_retries: i64,
    execution_ns: i64,
    elapsed_ms: i64,
    now: String,
}

impl FailTransition {
    async fn apply(&self, conn: &mut SqliteConnection) -> Result<Option<WorkItemRow>, sqlx::Error> {
        sqlx::query_as(
            r#"UPDATE work_items SET
                   status = CASE WHEN attempts >= ?1 THEN 'failed' ELSE 'pending' END,
                   error_message = ?2,
                   total_execution_ns = total_execution_ns + ?3,
                   completed_at = CASE WHEN attempts >= ?1 THEN ?4 ELSE completed_at END,
                   total_elapsed_ms = CASE WHEN attempts >= ?1 THEN ?5 ELSE total_elapsed_ms END,
                   updated_at = ?4
               WHERE id = ?6 AND status = 'active'
               RETURNING *"#,
        )
        .bind(self.max_retries)
        .bind(&self.error)
        .bind(self.execution_ns)
        .bind(&self.now)
        .bind(self.elapsed_ms)
        .bind(&self.id)
        .fetch_all(conn)
        .await
        .map(|mut rows| rows.pop())
    }
}

#[async_trait]
impl WorkStore for SqliteWorkStore {
    #[instrument(skip(self, item), fields(item_id = %item.id), err)]
    async fn add(&self, mut item: WorkItem) -> DomainResult<Uuid> {
        item.validate()?;

        let now = Utc::now();
        item.status = WorkStatus::Pending;
        item.attempts = 0;
        item.created_at = now;
        item.updated_at = now;
        item.started_at = None;
        item.last_attempt_at = None;
        item.completed_at = None;
        item.total_execution_time = Duration::ZERO;
        item.total_elapsed_time = None;
        item.result = None;
        item.error_message = None;

        let blocked_by_json = serde_json::to_string(&item.blocked_by)?;
        let context_json = serde_json::to_string(&item.context)?;

        sqlx::query(
            r#"INSERT INTO work_items (id, item_type, title, description, priority, status,
               attempts, created_at, updated_at, total_execution_ns, parent_task_id,
               blocked_by, context)
               VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, 0, ?, ?, ?)"#,
        )
        .bind(item.id.to_string())
        .bind(&item.item_type)
        .bind(&item.title)
        .bind(&item.description)
        .bind(i64::from(item.priority))
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .bind(item.parent_task_id.map(|id| id.to_string()))
        .bind(&blocked_by_json)
        .bind(&context_json)
        .execute(&self.pool)
        .await?;

        debug!(priority = %item.priority, "work item added");
        Ok(item.id)
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as("SELECT * FROM work_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: WorkFilter) -> DomainResult<Vec<WorkItem>> {
        let mut query = String::from("SELECT * FROM work_items WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(parent_id) = &filter.parent_task_id {
            query.push_str(" AND parent_task_id = ?");
            bindings.push(parent_id.to_string());
        }
        if let Some(item_type) = &filter.item_type {
            query.push_str(" AND item_type = ?");
            bindings.push(item_type.clone());
        }

        query.push_str(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit.max(0)));
        }

        let mut q = sqlx::query_as::<_, WorkItemRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<WorkItemRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn statuses(&self, ids: &[Uuid]) -> DomainResult<HashMap<Uuid, WorkStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let query = format!("SELECT id, status FROM work_items WHERE id IN ({placeholders})");
        let mut q = sqlx::query_as::<_, (String, String)>(&query);
        for id in ids {
            q = q.bind(id.to_string());
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut statuses = HashMap::with_capacity(rows.len());
        for (id, status) in rows {
            let status = WorkStatus::from_str(&status).ok_or_else(|| {
                DomainError::SerializationError(format!("Invalid status: {status}"))
            })?;
            statuses.insert(parse_uuid(&id)?, status);
        }
        Ok(statuses)
    }

    async fn count_by_status(&self) -> DomainResult<HashMap<WorkStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM work_items GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status_str, count) in rows {
            if let Some(status) = WorkStatus::from_str(&status_str) {
                counts.insert(status, u64::try_from(count).unwrap_or(0));
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> DomainResult<Option<WorkItem>> {
        let now = format_datetime(Utc::now());
        let query = format!(
            r#"UPDATE work_items SET
                   status = 'active',
                   attempts = attempts + 1,
                   started_at = COALESCE(started_at, ?1),
                   last_attempt_at = ?1,
                   updated_at = ?1
               WHERE id = (
                   SELECT candidate.id FROM work_items AS candidate
                   WHERE candidate.status = 'pending' AND {BLOCKERS_SATISFIED}
                   ORDER BY candidate.priority ASC, candidate.created_at ASC, candidate.rowid ASC
                   LIMIT 1
               )
               AND status = 'pending'
               RETURNING *"#
        );

        let row: Option<WorkItemRow> = sqlx::query_as(&query)
            .bind(&now)
            .fetch_all(&self.pool)
            .await?
            .pop();

        let item = row.map(WorkItem::try_from).transpose()?;
        if let Some(item) = &item {
            info!(item_id = %item.id, attempt = item.attempts, priority = %item.priority, "claimed work item");
        }
        Ok(item)
    }

    #[instrument(skip(self), err)]
    async fn claim(&self, id: Uuid) -> DomainResult<Option<WorkItem>> {
        let now = format_datetime(Utc::now());
        let query = format!(
            r#"UPDATE work_items AS candidate SET
                   status = 'active',
                   attempts = attempts + 1,
                   started_at = COALESCE(started_at, ?1),
                   last_attempt_at = ?1,
                   updated_at = ?1
               WHERE candidate.id = ?2 AND candidate.status = 'pending' AND {BLOCKERS_SATISFIED}
               RETURNING *"#
        );

        let row: Option<WorkItemRow> = sqlx::query_as(&query)
            .bind(&now)
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?
            .pop();

        let item = row.map(WorkItem::try_from).transpose()?;
        if let Some(item) = &item {
            info!(item_id = %item.id, attempt = item.attempts, "claimed work item");
        }
        Ok(item)
    }

    #[instrument(skip(self, result), err)]
    async fn complete(
        &self,
        id: Uuid,
        result: WorkResult,
        execution_time: Duration,
    ) -> DomainResult<WorkItem> {
        let item = self.require(id).await?;
        require_status(&item, &[WorkStatus::Active], WorkStatus::Completed)?;

        let now = Utc::now();
        let result_json = serde_json::to_string(&result)?;

        let row: Option<WorkItemRow> = sqlx::query_as(
            r#"UPDATE work_items SET
                   status = 'completed',
                   result = ?,
                   total_execution_ns = total_execution_ns + ?,
                   total_elapsed_ms = ?,
                   completed_at = ?,
                   updated_at = ?
               WHERE id = ? AND status = 'active'
               RETURNING *"#,
        )
        .bind(&result_json)
        .bind(duration_to_nanos(execution_time))
        .bind(elapsed_millis(&item, now))
        .bind(format_datetime(now))
        .bind(format_datetime(now))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?
        .pop();

        match row {
            Some(row) => {
                let item = WorkItem::try_from(row)?;
                info!(attempts = item.attempts, "work item completed");
                Ok(item)
            }
            None => Err(self.transition_error(id, WorkStatus::Completed, "active").await),
        }
    }

    #[instrument(skip(self, error), err)]
    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        max_retries: u32,
        execution_time: Duration,
    ) -> DomainResult<WorkItem> {
        let item = self.require(id).await?;
        require_status(&item, &[WorkStatus::Active], WorkStatus::Failed)?;

        let now = Utc::now();
        let transition = FailTransition {
            id: id.to_string(),
            error: error.to_string(),
            max_retries: i64::from(max_retries),
            execution_ns: duration_to_nanos(execution_time),
            elapsed_ms: elapsed_millis(&item, now),
            now: format_datetime(now),
        };

        let mut conn = self.pool.acquire().await?;
        let row = transition.apply(&mut conn).await?;
        drop(conn);

        match row {
            Some(row) => {
                let item = WorkItem::try_from(row)?;
                if item.status == WorkStatus::Failed {
                    warn!(attempts = item.attempts, error, "work item failed permanently");
                } else {
                    info!(attempts = item.attempts, max_retries, error, "work item re-queued for retry");
                }
                Ok(item)
            }
            None => Err(self.transition_error(id, WorkStatus::Failed, "active").await),
        }
    }

    #[instrument(skip(self, reason), err)]
    async fn escalate(
        &self,
        id: Uuid,
        reason: &str,
        max_retries: u32,
        execution_time: Duration,
    ) -> DomainResult<WorkItem> {
        let item = self.require(id).await?;
        require_status(&item, &[WorkStatus::Active], WorkStatus::Hold)?;

        let now = Utc::now();
        let transition = FailTransition {
            id: id.to_string(),
            error: reason.to_string(),
            max_retries: i64::from(max_retries),
            execution_ns: duration_to_nanos(execution_time),
            elapsed_ms: elapsed_millis(&item, now),
            now: format_datetime(now),
        };

        let mut tx = self.pool.begin().await?;
        let Some(row) = transition.apply(&mut tx).await? else {
            tx.rollback().await?;
            return Err(self.transition_error(id, WorkStatus::Hold, "active").await);
        };

        let failed = WorkItem::try_from(row)?;
        if failed.status == WorkStatus::Failed {
            tx.commit().await?;
            warn!(attempts = failed.attempts, reason, "escalated work item failed permanently");
            return Ok(failed);
        }

        let mut context = failed.context.clone();
        context.hold_reason = Some(reason.to_string());
        context.held_at = Some(now);

        let row: Option<WorkItemRow> = sqlx::query_as(
            r#"UPDATE work_items SET status = 'hold', context = ?, updated_at = ?
               WHERE id = ? AND status = 'pending'
               RETURNING *"#,
        )
        .bind(serde_json::to_string(&context)?)
        .bind(format_datetime(now))
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await?
        .pop();

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(self.transition_error(id, WorkStatus::Hold, "pending").await);
        };
        tx.commit().await?;

        let held = WorkItem::try_from(row)?;
        warn!(attempts = held.attempts, reason, "work item escalated to hold for review");
        Ok(held)
    }

    #[instrument(skip(self, reason), err)]
    async fn hold(&self, id: Uuid, reason: &str) -> DomainResult<WorkItem> {
        let item = self.require(id).await?;
        require_status(&item, &[WorkStatus::Pending, WorkStatus::Hold], WorkStatus::Hold)?;

        let now = Utc::now();
        let mut context = item.context;
        context.hold_reason = Some(reason.to_string());
        context.held_at = Some(now);

        let row: Option<WorkItemRow> = sqlx::query_as(
            r#"UPDATE work_items SET status = 'hold', context = ?, updated_at = ?
               WHERE id = ? AND status IN ('pending', 'hold')
               RETURNING *"#,
        )
        .bind(serde_json::to_string(&context)?)
        .bind(format_datetime(now))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?
        .pop();

        match row {
            Some(row) => {
                info!(reason, "work item put on hold");
                row.try_into()
            }
            None => Err(self.transition_error(id, WorkStatus::Hold, "pending or hold").await),
        }
    }

    #[instrument(skip(self), err)]
    async fn release(&self, id: Uuid) -> DomainResult<WorkItem> {
        let item = self.require(id).await?;
        require_status(&item, &[WorkStatus::Hold], WorkStatus::Pending)?;

        let now = Utc::now();
        let mut context = item.context;
        context.released_at = Some(now);

        let row: Option<WorkItemRow> = sqlx::query_as(
            r#"UPDATE work_items SET status = 'pending', context = ?, updated_at = ?
               WHERE id = ? AND status = 'hold'
               RETURNING *"#,
        )
        .bind(serde_json::to_string(&context)?)
        .bind(format_datetime(now))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?
        .pop();

        match row {
            Some(row) => {
                info!("work item released from hold");
                row.try_into()
            }
            None => Err(self.transition_error(id, WorkStatus::Pending, "hold").await),
        }
    }

    #[instrument(skip(self, patch), err)]
    async fn update(&self, id: Uuid, patch: WorkItemPatch) -> DomainResult<WorkItem> {
        // Optimistic write keyed on updated_at, so a concurrent transition
        // is never overwritten with stale context.
        for _ in 0..UPDATE_ATTEMPTS {
            let mut item = self.require(id).await?;
            let previous_update = format_datetime(item.updated_at);
            patch.clone().apply_to(&mut item)?;

            let row: Option<WorkItemRow> = sqlx::query_as(
                r#"UPDATE work_items SET
                       item_type = ?, title = ?, description = ?, priority = ?,
                       parent_task_id = ?, blocked_by = ?, context = ?, updated_at = ?
                   WHERE id = ? AND updated_at = ?
                   RETURNING *"#,
            )
            .bind(&item.item_type)
            .bind(&item.title)
            .bind(&item.description)
            .bind(i64::from(item.priority))
            .bind(item.parent_task_id.map(|id| id.to_string()))
            .bind(serde_json::to_string(&item.blocked_by)?)
            .bind(serde_json::to_string(&item.context)?)
            .bind(format_datetime(Utc::now()))
            .bind(id.to_string())
            .bind(&previous_update)
            .fetch_all(&self.pool)
            .await?
            .pop();

            if let Some(row) = row {
                return row.try_into();
            }
            debug!("work item changed during update, retrying");
        }

        Err(DomainError::ConcurrencyConflict(id))
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    item_type: String,
    title: String,
    description: String,
    priority: i64,
    status: String,
    attempts: i64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    last_attempt_at: Option<String>,
    completed_at: Option<String>,
    total_execution_ns: i64,
    total_elapsed_ms: Option<i64>,
    parent_task_id: Option<String>,
    blocked_by: Option<String>,
    context: Option<String>,
    result: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = DomainError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let status = WorkStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        let blocked_by: BTreeSet<Uuid> = parse_json_or_default(row.blocked_by)?;
        let context: WorkContext = parse_json_or_default(row.context)?;
        let result: Option<WorkResult> = row
            .result
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| DomainError::SerializationError(e.to_string()))?;

        Ok(WorkItem {
            id: parse_uuid(&row.id)?,
            item_type: row.item_type,
            title: row.title,
            description: row.description,
            priority: Priority::new(row.priority)?,
            status,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            last_attempt_at: parse_optional_datetime(row.last_attempt_at)?,
            completed_at: parse_optional_datetime(row.completed_at)?,
            total_execution_time: nanos_to_duration(row.total_execution_ns),
            total_elapsed_time: row.total_elapsed_ms.map(millis_to_duration),
            parent_task_id: parse_optional_uuid(row.parent_task_id)?,
            blocked_by,
            context,
            result,
            error_message: row.error_message,
        })
    }
}
