//! Pluggable "stuck" detection for convergence output.

use regex::{Regex, RegexBuilder};

use crate::domain::errors::{DomainError, DomainResult};

/// Phrases that mean the executor has given up on its own.
pub const DEFAULT_STUCK_PHRASES: &[&str] = &[
    "cannot proceed",
    "can't proceed",
    "unable to proceed",
    "need human intervention",
    "requires human intervention",
    "need human input",
    "i am stuck",
    "i'm stuck",
];

/// Decides whether one piece of executor output signals a stuck loop.
pub trait StuckMatcher: Send + Sync {
    /// Label recorded on the iteration that matched
    fn name(&self) -> &str;

    fn matches(&self, text: &str) -> bool;
}

/// Case-insensitive substring match.
#[derive(Debug, Clone)]
pub struct PhraseMatcher {
    phrase: String,
}

impl PhraseMatcher {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self {
            phrase: phrase.into().to_lowercase(),
        }
    }
}

impl StuckMatcher for PhraseMatcher {
    fn name(&self) -> &str {
        &self.phrase
    }

    fn matches(&self, text: &str) -> bool {
        text.to_lowercase().contains(&self.phrase)
    }
}

/// Regular-expression match.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: String,
    regex: Regex,
}

impl RegexMatcher {
    /// Compile `pattern` case-insensitively.
    pub fn new(pattern: &str) -> DomainResult<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| DomainError::ValidationFailed(format!("invalid stuck pattern {pattern:?}: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }
}

impl StuckMatcher for RegexMatcher {
    fn name(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Built-in phrase matchers, in order.
pub fn default_stuck_matchers() -> Vec<Box<dyn StuckMatcher>> {
    DEFAULT_STUCK_PHRASES
        .iter()
        .map(|phrase| Box::new(PhraseMatcher::new(*phrase)) as Box<dyn StuckMatcher>)
        .collect()
}

/// Regex matchers for configured patterns, or the defaults when none are set.
pub fn matchers_from_patterns(patterns: &[String]) -> DomainResult<Vec<Box<dyn StuckMatcher>>> {
    if patterns.is_empty() {
        return Ok(default_stuck_matchers());
    }
    patterns
        .iter()
        .map(|p| RegexMatcher::new(p).map(|m| Box::new(m) as Box<dyn StuckMatcher>))
        .collect()
}

/// Name of the first matcher that fires on `text`.
pub fn first_match<'a>(matchers: &'a [Box<dyn StuckMatcher>], text: &str) -> Option<&'a str> {
    matchers.iter().find(|m| m.matches(text)).map(|m| m.name())
}
