//! Scripted executor for testing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{ExecutionResult, Executor};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Return this result
    Result(ExecutionResult),
    /// Fail the call itself
    Error(String),
    /// Sleep, then return the result
    Delayed(Duration, ExecutionResult),
}

impl MockResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self::Result(ExecutionResult::success(content))
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Result(ExecutionResult::failure(error))
    }
}

/// Replays queued responses in order, then the fallback forever.
#[derive(Clone)]
pub struct MockExecutor {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    fallback: MockResponse,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_fallback(MockResponse::success("Mock task completed successfully."))
    }

    pub fn with_fallback(fallback: MockResponse) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Executor that answers with each response once, in order.
    pub fn scripted(responses: impl IntoIterator<Item = MockResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            ..Self::new()
        }
    }

    pub async fn push(&self, response: MockResponse) {
        self.responses.lock().await.push_back(response);
    }

    /// Prompts received so far.
    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, prompt: &str) -> DomainResult<ExecutionResult> {
        self.prompts.lock().await.push(prompt.to_string());
        let response = self
            .responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match response {
            MockResponse::Result(result) => Ok(result),
            MockResponse::Error(message) => Err(DomainError::ExecutionFailed(message)),
            MockResponse::Delayed(delay, result) => {
                tokio::time::sleep(delay).await;
                Ok(result)
            }
        }
    }
}
