//! CLI command implementations

pub mod init;
pub mod run;
pub mod task;
pub mod validate;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::adapters::sqlite::{initialize_from_config, SqliteWorkStore};
use crate::domain::models::Config;

/// Open the configured database and wrap it in a work store.
pub(crate) async fn open_store(config: &Config) -> Result<(SqlitePool, Arc<SqliteWorkStore>)> {
    let pool = initialize_from_config(&config.database)
        .await
        .with_context(|| {
            format!(
                "Failed to open database at {}. Run 'taskloop init' first.",
                config.database.path
            )
        })?;
    let store = Arc::new(SqliteWorkStore::new(pool.clone()));
    Ok((pool, store))
}
