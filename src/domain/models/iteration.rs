//! Convergence loop session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a convergence session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The executor emitted the completion promise
    Promise,
    /// The executor reported it cannot make progress
    Stuck,
    /// The iteration budget ran out
    MaxIterations,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promise => "promise",
            Self::Stuck => "stuck",
            Self::MaxIterations => "max_iterations",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Promise)
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single executor call inside a convergence loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number
    pub iteration: u32,
    /// Whether the executor call produced output
    pub success: bool,
    pub stuck: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promise_text: Option<String>,
    pub summary: String,
    /// Timeout or executor failure recorded for this iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Name of the stuck matcher that fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_pattern: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// State of one convergence loop invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationSession {
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<IterationRecord>,
    pub is_complete: bool,
    pub completion_reason: Option<CompletionReason>,
}

impl IterationSession {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            current_iteration: 0,
            max_iterations,
            history: Vec::new(),
            is_complete: false,
            completion_reason: None,
        }
    }

    /// The most recent iteration record, if any.
    pub fn last_record(&self) -> Option<&IterationRecord> {
        self.history.last()
    }

    /// Number of iterations that ended in a timeout or executor failure.
    pub fn error_count(&self) -> usize {
        self.history.iter().filter(|r| r.error.is_some()).count()
    }
}
