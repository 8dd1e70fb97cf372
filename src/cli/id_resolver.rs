//! Short ID prefix resolution for CLI commands.
//!
//! Allows users to specify any unique prefix of a UUID instead of the full
//! 36-char ID, similar to git short hashes.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

const WORK_ITEM_QUERY: &str = "SELECT id FROM work_items WHERE id LIKE ? LIMIT 11";

fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        bail!("ID prefix must not be empty");
    }
    if !prefix.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
        bail!("Invalid ID prefix '{prefix}': must contain only hex characters and dashes");
    }
    Ok(())
}

/// Resolve a work item ID prefix to a full UUID.
pub async fn resolve_work_item_id(pool: &SqlitePool, prefix: &str) -> Result<Uuid> {
    // Fast path: if it parses as a full UUID, return directly
    if let Ok(uuid) = Uuid::parse_str(prefix) {
        return Ok(uuid);
    }

    validate_prefix(prefix)?;
    let pattern = format!("{}%", prefix.to_lowercase());

    let rows: Vec<(String,)> = sqlx::query_as(WORK_ITEM_QUERY)
        .bind(&pattern)
        .fetch_all(pool)
        .await?;

    match rows.as_slice() {
        [] => bail!("No work item found matching prefix '{prefix}'"),
        [(id,)] => Ok(Uuid::parse_str(id)?),
        many => {
            let candidates: Vec<&str> = many.iter().take(10).map(|(id,)| id.as_str()).collect();
            bail!(
                "Ambiguous work item prefix '{prefix}' matches {}{} items:\n  {}",
                if many.len() > 10 { "more than " } else { "" },
                many.len().min(10),
                candidates.join("\n  ")
            )
        }
    }
}
