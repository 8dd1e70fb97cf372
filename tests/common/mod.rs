//! Common test utilities for integration tests
//!
//! Provides shared fixtures and helpers used across multiple integration
//! test files.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use taskloop::adapters::sqlite::{create_migrated_test_pool, initialize_database, PoolConfig, SqliteWorkStore};
use taskloop::domain::models::Config;

/// In-memory store with all migrations applied.
pub async fn setup_store() -> Arc<SqliteWorkStore> {
    let pool = create_migrated_test_pool()
        .await
        .expect("Failed to create test pool");
    Arc::new(SqliteWorkStore::new(pool))
}

/// File-backed store with a multi-connection pool, for tests that need
/// real concurrent writers. Keep the returned directory alive.
pub async fn setup_file_store(max_connections: u32) -> (TempDir, Arc<SqliteWorkStore>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite:{}", dir.path().join("queue.db").display());
    let pool = initialize_database(
        &url,
        Some(PoolConfig {
            max_connections,
            ..PoolConfig::default()
        }),
    )
    .await
    .expect("Failed to initialize file database");
    (dir, Arc::new(SqliteWorkStore::new(pool)))
}

/// Configuration tuned for fast tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.max_retries = 3;
    config.scheduler.poll_interval_ms = 10;
    config.scheduler.workers = 1;
    config.scheduler.subtask_concurrency = 2;
    config.convergence.default_max_iterations = 5;
    config
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
