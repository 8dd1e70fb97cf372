//! Prompt validation results for convergence loops.

use serde::{Deserialize, Serialize};

/// Which rule established that a prompt can terminate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionType {
    Promise,
    MaxIterations,
    Criteria,
    Implicit,
    #[default]
    None,
}

impl CompletionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promise => "promise",
            Self::MaxIterations => "max_iterations",
            Self::Criteria => "criteria",
            Self::Implicit => "implicit",
            Self::None => "none",
        }
    }
}

/// Validator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Iteration cap supplied outside the prompt text
    pub max_iterations: Option<u32>,
    /// Reject implicit completion phrases
    pub strict: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            strict: true,
        }
    }
}

/// Result of checking a prompt for completion criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub completion_type: CompletionType,
    pub promise_text: Option<String>,
    /// Iteration cap found in config or prompt text
    pub max_iterations: Option<u32>,
    pub success_criteria: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}
