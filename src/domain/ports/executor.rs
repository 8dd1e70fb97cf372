//! Executor port - the external actor that runs a prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;

/// Result of one executor call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub content: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            files_changed: Vec::new(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            files_changed: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.files_changed = files.into_iter().map(Into::into).collect();
        self
    }
}

/// Trait for executor implementations.
///
/// The engine depends on nothing beyond this call. An `Err` means the
/// executor itself could not run (spawn failure, transport error); a
/// completed call that did not succeed is an `Ok` with `success == false`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor type name, for logs.
    fn name(&self) -> &'static str;

    /// Run one prompt to completion.
    async fn execute(&self, prompt: &str) -> DomainResult<ExecutionResult>;
}
