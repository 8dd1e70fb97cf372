//! Executor that pipes the prompt into an external command.
//!
//! The prompt is written to the child's stdin. Stdout becomes the result
//! content, stderr the error text. Lines of the form `FILE_CHANGED: <path>`
//! on stdout are collected as changed files.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ExecutorConfig;
use crate::domain::ports::{ExecutionResult, Executor};

const FILE_CHANGED_MARKER: &str = "FILE_CHANGED:";

/// Runs each prompt as a fresh child process.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Paths announced by `FILE_CHANGED:` lines, in order, without duplicates.
pub fn parse_changed_files(output: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for line in output.lines() {
        if let Some(path) = line.trim().strip_prefix(FILE_CHANGED_MARKER) {
            let path = path.trim();
            if !path.is_empty() && !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        }
    }
    files
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn execute(&self, prompt: &str) -> DomainResult<ExecutionResult> {
        let mut child = self.build_command().spawn().map_err(|e| {
            DomainError::ExecutionFailed(format!("Failed to spawn {}: {}", self.config.command, e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DomainError::ExecutionFailed("Failed to capture stdin".to_string()))?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
        let prompt = prompt.to_string();
        let writer = tokio::spawn(async move {
            let written = stdin.write_all(prompt.as_bytes()).await;
            drop(stdin);
            written
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DomainError::ExecutionFailed(format!("Failed to wait for process: {e}")))?;

        match writer.await {
            Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                warn!(error = %e, "failed writing prompt to executor stdin");
            }
            Err(e) => warn!(error = %e, "stdin writer task failed"),
            _ => {}
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let files_changed = parse_changed_files(&stdout);

        debug!(
            command = %self.config.command,
            status = %output.status,
            stdout_bytes = output.stdout.len(),
            files = files_changed.len(),
            "executor process finished"
        );

        if output.status.success() {
            Ok(ExecutionResult::success(stdout).with_files(files_changed))
        } else {
            let error = if stderr.is_empty() {
                format!("{} exited with {}", self.config.command, output.status)
            } else {
                stderr
            };
            Ok(ExecutionResult {
                success: false,
                content: stdout,
                files_changed,
                error: Some(error),
            })
        }
    }
}
