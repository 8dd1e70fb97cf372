use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure for taskloop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker loop and retry policy
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Convergence loop inputs
    #[serde(default)]
    pub convergence: ConvergenceConfig,

    /// External executor command
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".taskloop/taskloop.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// `sqlx` connection URL for the configured path.
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite:{}", self.path)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Rotation policy for file logs: daily, hourly, never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Also log to stderr when a log directory is set
    #[serde(default = "default_true")]
    pub enable_stderr: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            enable_stderr: true,
        }
    }
}

/// Worker loop and retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Claims allowed before a failing item becomes terminal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Idle delay between empty claim attempts
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on a single executor call
    #[serde(default = "default_iteration_timeout_secs")]
    pub iteration_timeout_secs: u64,

    /// Subtasks of one parent dispatched at once
    #[serde(default = "default_subtask_concurrency")]
    pub subtask_concurrency: usize,
}

const fn default_workers() -> usize {
    1
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_poll_interval_ms() -> u64 {
    2_000
}

const fn default_iteration_timeout_secs() -> u64 {
    1_800
}

const fn default_subtask_concurrency() -> usize {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            iteration_timeout_secs: default_iteration_timeout_secs(),
            subtask_concurrency: default_subtask_concurrency(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Convergence loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConvergenceConfig {
    /// Iteration cap for convergent items that do not carry one
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    /// Promise text expected when the item does not name one
    #[serde(default)]
    pub completion_promise: Option<String>,

    /// Refuse to start a loop whose prompt declares no completion criteria
    #[serde(default = "default_true")]
    pub require_completion_criteria: bool,

    /// Treat implicit completion phrases as warnings only
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Case-insensitive regexes marking executor output as stuck; the
    /// built-in list is used when empty
    #[serde(default)]
    pub stuck_patterns: Vec<String>,
}

const fn default_max_iterations() -> u32 {
    10
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            completion_promise: None,
            require_completion_criteria: true,
            strict: true,
            stuck_patterns: Vec::new(),
        }
    }
}

/// External executor command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutorConfig {
    /// Program receiving the prompt on stdin
    #[serde(default = "default_executor_command")]
    pub command: String,

    /// Arguments passed to the program
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,

    /// Working directory for the program
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_executor_command() -> String {
    "claude".to_string()
}

fn default_executor_args() -> Vec<String> {
    vec!["--print".to_string()]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            args: default_executor_args(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}
