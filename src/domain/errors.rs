//! Domain errors for the taskloop work queue.

use thiserror::Error;
use uuid::Uuid;

/// Format a cycle path as a human-readable string: `A -> B -> C -> A`.
fn format_cycle_path(path: &[Uuid]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Domain-level errors that can occur in the work queue and convergence engine.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Work item not found: {0}")]
    WorkItemNotFound(Uuid),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition { from: String, to: String, reason: String },

    #[error("Dependency cycle detected: {}", format_cycle_path(.0))]
    DependencyCycle(Vec<Uuid>),

    #[error("Invalid priority: {0} (must be 1-5)")]
    InvalidPriority(i64),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("No completion criteria found in prompt; suggestions: {}", .suggestions.join("; "))]
    MissingCompletionCriteria { suggestions: Vec<String> },

    #[error("Concurrency conflict: work item {0} was modified")]
    ConcurrencyConflict(Uuid),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
