//! Bounded convergence loop state machine.
//!
//! The controller never calls the executor itself. The scheduler feeds it
//! one output (or one error) per executor call and asks whether to go on,
//! which keeps every routing decision at the scheduler/store boundary.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::models::{CompletionReason, IterationRecord, IterationSession};
use crate::services::convergence_validator::extract_completion_signal;
use crate::services::stuck_detection::{first_match, StuckMatcher};

/// Longest summary kept per iteration, in characters.
pub const MAX_SUMMARY_CHARS: usize = 200;

const SUMMARY_MARKER: &str = "summary:";

pub struct IterationController {
    session: IterationSession,
    matchers: Arc<Vec<Box<dyn StuckMatcher>>>,
    expected_promise: Option<String>,
}

impl IterationController {
    /// `expected_promise`, when set, is the only promise text that completes
    /// the session (compared trimmed and case-insensitively).
    pub fn new(
        max_iterations: u32,
        matchers: Arc<Vec<Box<dyn StuckMatcher>>>,
        expected_promise: Option<String>,
    ) -> Self {
        Self {
            session: IterationSession::new(max_iterations),
            matchers,
            expected_promise: expected_promise
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn session(&self) -> &IterationSession {
        &self.session
    }

    pub fn into_session(self) -> IterationSession {
        self.session
    }

    /// Clear counters and history, keeping the iteration cap.
    pub fn reset(&mut self) {
        self.session = IterationSession::new(self.session.max_iterations);
    }

    fn promise_completes(&self, promise: &str) -> bool {
        match &self.expected_promise {
            Some(expected) => promise.trim().eq_ignore_ascii_case(expected),
            None => true,
        }
    }

    /// Record one executor output and update completion state.
    ///
    /// A matching promise completes the session before stuck matchers are
    /// consulted.
    pub fn process_output(&mut self, output: &str) -> IterationRecord {
        self.session.current_iteration += 1;

        let promise_text = extract_completion_signal(output);
        let promised = promise_text.as_deref().is_some_and(|p| self.promise_completes(p));
        let matched_pattern = if promised {
            None
        } else {
            first_match(&self.matchers, output).map(str::to_string)
        };

        if promised {
            self.session.is_complete = true;
            self.session.completion_reason = Some(CompletionReason::Promise);
        } else if matched_pattern.is_some() {
            self.session.is_complete = true;
            self.session.completion_reason = Some(CompletionReason::Stuck);
        }

        let record = IterationRecord {
            iteration: self.session.current_iteration,
            success: true,
            stuck: matched_pattern.is_some(),
            promise_text,
            summary: summarize(output),
            error: None,
            matched_pattern,
            recorded_at: Utc::now(),
        };
        self.session.history.push(record.clone());
        record
    }

    /// Record a timed-out or failed executor call. Consumes one iteration
    /// and never marks the session stuck.
    pub fn record_error(&mut self, error: &str) -> IterationRecord {
        self.session.current_iteration += 1;
        let record = IterationRecord {
            iteration: self.session.current_iteration,
            success: false,
            stuck: false,
            promise_text: None,
            summary: truncate_chars(error.trim(), MAX_SUMMARY_CHARS),
            error: Some(error.to_string()),
            matched_pattern: None,
            recorded_at: Utc::now(),
        };
        self.session.history.push(record.clone());
        record
    }

    /// Whether another executor call is allowed. Exhausting the budget
    /// completes the session with [`CompletionReason::MaxIterations`].
    pub fn should_continue(&mut self) -> bool {
        if self.session.is_complete {
            return false;
        }
        if self.session.current_iteration >= self.session.max_iterations {
            self.session.is_complete = true;
            self.session.completion_reason = Some(CompletionReason::MaxIterations);
            return false;
        }
        true
    }
}

/// Short summary of one output: the text after a `summary:` marker, else
/// the first non-empty line that is not a markdown heading.
pub fn summarize(output: &str) -> String {
    let marked = output.lines().find_map(|line| {
        let lower = line.to_lowercase();
        let start = lower.find(SUMMARY_MARKER)? + SUMMARY_MARKER.len();
        // to_lowercase can shift byte offsets for some scripts
        let text = line.get(start..).unwrap_or_default().trim();
        (!text.is_empty()).then_some(text)
    });

    let line = marked.or_else(|| {
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
    });

    line.map(|l| truncate_chars(l, MAX_SUMMARY_CHARS)).unwrap_or_default()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
