//! taskloop - priority work queue with convergent execution
//!
//! Work items are claimed from a persistent priority queue by worker loops
//! and handed to an external executor, either once or repeatedly until the
//! executor emits a completion promise, reports it is stuck, or runs out of
//! iterations.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, errors and the port traits
//! - **Adapters** (`adapters`): SQLite work store and executor implementations
//! - **Service Layer** (`services`): validation, convergence loop, dependency
//!   resolution and scheduling
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use taskloop::adapters::executors::CommandExecutor;
//! use taskloop::adapters::sqlite::{initialize_from_config, SqliteWorkStore};
//! use taskloop::{ConfigLoader, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let pool = initialize_from_config(&config.database).await?;
//!     let store = Arc::new(SqliteWorkStore::new(pool));
//!     let executor = Arc::new(CommandExecutor::new(config.executor.clone()));
//!     let stats = Scheduler::new(store, executor, &config)?.run_until_idle().await?;
//!     println!("{} completed", stats.completed);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    CompletionReason, CompletionType, Config, ExecutionMode, IterationRecord, IterationSession,
    Priority, ValidationConfig, ValidationResult, WorkContext, WorkItem, WorkItemPatch, WorkResult,
    WorkStatus,
};
pub use domain::ports::{ExecutionResult, Executor, WorkFilter, WorkStore};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    DependencyResolver, DispatchOutcome, IterationController, Scheduler, SchedulerStats,
    SubtaskReport, WorkQueueService,
};
