//! Work item domain model.
//!
//! Work items are discrete units of queued work handed to an executor.
//! Subtasks link to a parent and may be blocked by sibling items.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::iteration::IterationSession;

/// Current layout version of [`WorkContext`].
pub const CONTEXT_VERSION: u32 = 1;

/// Upper bound on caller-defined context extension entries.
pub const MAX_CONTEXT_EXTENSIONS: usize = 32;

/// Upper bound on the length of an extension key.
pub const MAX_EXTENSION_KEY_LEN: usize = 64;

/// Status of a work item in the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Parked by an operator (or escalation); invisible to claims
    Hold,
    /// Claimed by exactly one worker
    Active,
    /// Finished successfully
    Completed,
    /// Retries exhausted
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Hold => "hold",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "hold" | "held" => Some(Self::Hold),
            "active" | "running" => Some(Self::Active),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<WorkStatus> {
        match self {
            Self::Pending => vec![Self::Active, Self::Hold],
            Self::Hold => vec![Self::Hold, Self::Pending],
            Self::Active => vec![Self::Completed, Self::Pending, Self::Failed],
            Self::Completed | Self::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of a work item: 1 is the highest, 5 the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const DEFAULT: Priority = Priority(3);
    pub const LOWEST: Priority = Priority(5);

    pub fn new(value: i64) -> DomainResult<Self> {
        if (1..=5).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(DomainError::InvalidPriority(value))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<i64> for Priority {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for i64 {
    fn from(priority: Priority) -> Self {
        i64::from(priority.0)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a work item should be executed.
///
/// Direct mode hands the prompt to the executor once. Convergent mode
/// replays the same prompt until a completion signal, a stuck signal, or
/// the iteration cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Direct,
    Convergent {
        /// Iteration cap supplied by the classifying caller. Falls back to
        /// the configured default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        /// Promise text the executor must emit to signal completion.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completion_promise: Option<String>,
    },
}

impl ExecutionMode {
    pub fn is_convergent(&self) -> bool {
        matches!(self, Self::Convergent { .. })
    }
}

/// Structured metadata attached to a work item.
///
/// Known fields are typed; anything else goes into a bounded extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    #[serde(default = "default_context_version")]
    pub version: u32,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    /// Convergence session of the last attempt that ended without completing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session: Option<IterationSession>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn default_context_version() -> u32 {
    CONTEXT_VERSION
}

impl Default for WorkContext {
    fn default() -> Self {
        Self {
            version: CONTEXT_VERSION,
            execution_mode: ExecutionMode::default(),
            hold_reason: None,
            held_at: None,
            released_at: None,
            last_session: None,
            extensions: BTreeMap::new(),
        }
    }
}

impl WorkContext {
    /// Insert or replace an extension entry.
    pub fn set_extension(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> DomainResult<()> {
        let key = key.into();
        if key.is_empty() || key.len() > MAX_EXTENSION_KEY_LEN {
            return Err(DomainError::ValidationFailed(format!(
                "context extension key must be 1-{MAX_EXTENSION_KEY_LEN} characters"
            )));
        }
        if !self.extensions.contains_key(&key) && self.extensions.len() >= MAX_CONTEXT_EXTENSIONS {
            return Err(DomainError::ValidationFailed(format!(
                "context holds at most {MAX_CONTEXT_EXTENSIONS} extension entries"
            )));
        }
        self.extensions.insert(key, value);
        Ok(())
    }

    /// Merge another extension map into this one, respecting the bound.
    pub fn merge_extensions(
        &mut self,
        other: BTreeMap<String, serde_json::Value>,
    ) -> DomainResult<()> {
        for (key, value) in other {
            self.set_extension(key, value)?;
        }
        Ok(())
    }
}

/// Terminal outcome payload of a work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// Final executor output
    pub content: String,
    /// Files the executor reported as changed, across all iterations
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Convergence loop summary, for convergent items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<IterationSession>,
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    /// Free-form classification supplied by the caller
    pub item_type: String,
    pub title: String,
    /// Prompt handed to the executor
    pub description: String,
    pub priority: Priority,
    pub status: WorkStatus,
    /// Number of claims so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once, on the first claim
    pub started_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Executor work time summed over all attempts
    pub total_execution_time: Duration,
    /// Wall-clock time from start (or creation) to the terminal state
    pub total_elapsed_time: Option<Duration>,
    pub parent_task_id: Option<Uuid>,
    pub blocked_by: BTreeSet<Uuid>,
    pub context: WorkContext,
    pub result: Option<WorkResult>,
    pub error_message: Option<String>,
}

impl WorkItem {
    /// Create a new pending work item.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            item_type: "task".to_string(),
            title: title.into(),
            description: description.into(),
            priority: Priority::default(),
            status: WorkStatus::default(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            last_attempt_at: None,
            completed_at: None,
            total_execution_time: Duration::ZERO,
            total_elapsed_time: None,
            parent_task_id: None,
            blocked_by: BTreeSet::new(),
            context: WorkContext::default(),
            result: None,
            error_message: None,
        }
    }

    pub fn with_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = item_type.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_task_id = Some(parent_id);
        self
    }

    /// Add a blocking dependency. Self-references are ignored.
    pub fn blocked_by(mut self, id: Uuid) -> Self {
        if id != self.id {
            self.blocked_by.insert(id);
        }
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.context.execution_mode = mode;
        self
    }

    /// Mark this item for convergent execution.
    pub fn convergent(self, max_iterations: Option<u32>, completion_promise: Option<String>) -> Self {
        self.with_execution_mode(ExecutionMode::Convergent {
            max_iterations,
            completion_promise,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Prompt handed to the executor: the description, or the title when
    /// no description was given.
    pub fn prompt(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.title
        } else {
            &self.description
        }
    }

    /// Validate caller-supplied fields.
    pub fn validate(&self) -> DomainResult<()> {
        if self.title.trim().is_empty() {
            return Err(DomainError::ValidationFailed(
                "work item title cannot be empty".to_string(),
            ));
        }
        if self.blocked_by.contains(&self.id) {
            return Err(DomainError::ValidationFailed(
                "work item cannot block itself".to_string(),
            ));
        }
        if self.parent_task_id == Some(self.id) {
            return Err(DomainError::ValidationFailed(
                "work item cannot be its own parent".to_string(),
            ));
        }
        if let ExecutionMode::Convergent { max_iterations: Some(0), .. } = self.context.execution_mode {
            return Err(DomainError::ValidationFailed(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Field merge applied by [`WorkStore::update`](crate::domain::ports::WorkStore::update).
///
/// There is deliberately no status field: status only moves through the
/// store's transition operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkItemPatch {
    pub item_type: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub parent_task_id: Option<Option<Uuid>>,
    pub blocked_by: Option<BTreeSet<Uuid>>,
    pub execution_mode: Option<ExecutionMode>,
    pub last_session: Option<IterationSession>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl WorkItemPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch to an item in memory.
    pub fn apply_to(self, item: &mut WorkItem) -> DomainResult<()> {
        if let Some(item_type) = self.item_type {
            item.item_type = item_type;
        }
        if let Some(title) = self.title {
            item.title = title;
        }
        if let Some(description) = self.description {
            item.description = description;
        }
        if let Some(priority) = self.priority {
            item.priority = priority;
        }
        if let Some(parent) = self.parent_task_id {
            item.parent_task_id = parent;
        }
        if let Some(blocked_by) = self.blocked_by {
            item.blocked_by = blocked_by;
        }
        if let Some(mode) = self.execution_mode {
            item.context.execution_mode = mode;
        }
        if let Some(session) = self.last_session {
            item.context.last_session = Some(session);
        }
        item.context.merge_extensions(self.extensions)?;
        item.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_defaults() {
        let item = WorkItem::new("Fix login", "Fix the login redirect");
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.priority, Priority::DEFAULT);
        assert_eq!(item.attempts, 0);
        assert!(item.started_at.is_none());
        assert_eq!(item.total_execution_time, Duration::ZERO);
        assert!(!item.context.execution_mode.is_convergent());
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(6).is_err());
        assert_eq!(Priority::new(1).unwrap(), Priority::HIGHEST);
        assert_eq!(Priority::new(5).unwrap(), Priority::LOWEST);
        assert!(Priority::HIGHEST < Priority::LOWEST);
    }

    #[test]
    fn test_priority_serde_rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("9").is_err());
        assert_eq!(serde_json::from_str::<Priority>("2").unwrap().value(), 2);
    }

    #[test]
    fn test_status_edges() {
        assert!(WorkStatus::Pending.can_transition_to(WorkStatus::Active));
        assert!(WorkStatus::Pending.can_transition_to(WorkStatus::Hold));
        assert!(WorkStatus::Hold.can_transition_to(WorkStatus::Pending));
        assert!(!WorkStatus::Hold.can_transition_to(WorkStatus::Active));
        assert!(WorkStatus::Active.can_transition_to(WorkStatus::Pending));
        assert!(!WorkStatus::Completed.can_transition_to(WorkStatus::Hold));
        assert!(!WorkStatus::Failed.can_transition_to(WorkStatus::Active));
        assert!(WorkStatus::Failed.is_terminal());
    }

    #[test]
    fn test_blocked_by_ignores_self() {
        let item = WorkItem::new("a", "b");
        let id = item.id;
        let item = item.blocked_by(id);
        assert!(item.blocked_by.is_empty());
    }

    #[test]
    fn test_context_extension_bound() {
        let mut ctx = WorkContext::default();
        for i in 0..MAX_CONTEXT_EXTENSIONS {
            ctx.set_extension(format!("k{i}"), serde_json::json!(i)).unwrap();
        }
        assert!(ctx.set_extension("overflow", serde_json::json!(1)).is_err());
        // Replacing an existing key is still allowed at the bound
        ctx.set_extension("k0", serde_json::json!("again")).unwrap();
        assert!(ctx.set_extension("", serde_json::json!(1)).is_err());
    }

    #[test]
    fn test_context_round_trips_with_missing_fields() {
        let ctx: WorkContext = serde_json::from_str("{}").unwrap();
        assert_eq!(ctx.version, CONTEXT_VERSION);
        assert_eq!(ctx.execution_mode, ExecutionMode::Direct);

        let ctx: WorkContext = serde_json::from_str(
            r#"{"execution_mode":{"mode":"convergent","max_iterations":4}}"#,
        )
        .unwrap();
        assert_eq!(
            ctx.execution_mode,
            ExecutionMode::Convergent { max_iterations: Some(4), completion_promise: None }
        );
    }

    #[test]
    fn test_patch_applies_and_validates() {
        let mut item = WorkItem::new("Old", "desc");
        let patch = WorkItemPatch {
            title: Some("New".into()),
            priority: Some(Priority::HIGHEST),
            ..Default::default()
        };
        patch.apply_to(&mut item).unwrap();
        assert_eq!(item.title, "New");
        assert_eq!(item.priority, Priority::HIGHEST);

        let id = item.id;
        let bad = WorkItemPatch {
            blocked_by: Some([id].into_iter().collect()),
            ..Default::default()
        };
        assert!(bad.apply_to(&mut item).is_err());
    }

    #[test]
    fn test_zero_iteration_cap_rejected() {
        let item = WorkItem::new("Loop", "p").convergent(Some(0), None);
        assert!(matches!(item.validate(), Err(DomainError::ValidationFailed(_))));

        let mut item = WorkItem::new("Loop", "p");
        let patch = WorkItemPatch {
            execution_mode: Some(ExecutionMode::Convergent {
                max_iterations: Some(0),
                completion_promise: None,
            }),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut item).is_err());

        assert!(WorkItem::new("Loop", "p").convergent(Some(1), None).validate().is_ok());
    }

    #[test]
    fn test_prompt_falls_back_to_title() {
        let item = WorkItem::new("Only a title", "  ");
        assert_eq!(item.prompt(), "Only a title");
    }
}
