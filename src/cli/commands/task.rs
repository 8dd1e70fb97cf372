//! Work item CLI commands.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use comfy_table::Cell;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::SqliteWorkStore;
use crate::cli::commands::open_store;
use crate::cli::id_resolver::resolve_work_item_id;
use crate::cli::output::{format_duration, output, status_cell, table_with_header, truncate, CommandOutput};
use crate::domain::models::{
    Config, ExecutionMode, Priority, WorkItem, WorkItemPatch, WorkStatus,
};
use crate::domain::ports::{WorkFilter, WorkStore};
use crate::services::dependency_resolver::is_ready;
use crate::services::{DependencyResolver, WorkQueueService};

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommands,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Add a work item to the queue
    Add {
        /// Short title
        title: String,
        /// Prompt handed to the executor (defaults to the title)
        #[arg(short, long)]
        description: Option<String>,
        /// Priority, 1 (highest) to 5 (lowest)
        #[arg(short, long, default_value = "3")]
        priority: i64,
        /// Free-form item type
        #[arg(short = 't', long = "type", default_value = "task")]
        item_type: String,
        /// Parent work item ID (or unique prefix)
        #[arg(long)]
        parent: Option<String>,
        /// Blocking work item IDs (comma-separated, prefixes allowed)
        #[arg(short, long, value_delimiter = ',')]
        blocked_by: Vec<String>,
        /// Run as a convergence loop
        #[arg(long)]
        convergent: bool,
        /// Iteration cap for convergent execution (implies --convergent)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Completion promise for convergent execution (implies --convergent)
        #[arg(long)]
        promise: Option<String>,
        /// Context extension entries (format: "key=value")
        #[arg(long = "set")]
        extensions: Vec<String>,
    },
    /// List work items
    List {
        /// Filter by status (pending, hold, active, completed, failed)
        #[arg(short, long)]
        status: Option<String>,
        /// Filter by parent work item
        #[arg(long)]
        parent: Option<String>,
        /// Filter by item type
        #[arg(short = 't', long = "type")]
        item_type: Option<String>,
        /// Maximum number of items to display
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Show work item details
    Show {
        /// Work item ID (or unique prefix)
        id: String,
    },
    /// Park a pending item so workers skip it
    Hold {
        /// Work item ID (or unique prefix)
        id: String,
        /// Reason recorded on the item
        #[arg(short, long, default_value = "held by operator")]
        reason: String,
    },
    /// Return a held item to the queue
    Release {
        /// Work item ID (or unique prefix)
        id: String,
    },
    /// Change non-status fields of a work item
    Update {
        /// Work item ID (or unique prefix)
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        priority: Option<i64>,
        #[arg(short = 't', long = "type")]
        item_type: Option<String>,
        /// Replace the blocking set (comma-separated, prefixes allowed)
        #[arg(short, long, value_delimiter = ',', conflicts_with = "clear_blocked_by")]
        blocked_by: Option<Vec<String>>,
        /// Remove all blockers
        #[arg(long)]
        clear_blocked_by: bool,
        /// Context extension entries (format: "key=value")
        #[arg(long = "set")]
        extensions: Vec<String>,
    },
    /// Show the subtasks of a parent and which are ready
    Subtasks {
        /// Parent work item ID (or unique prefix)
        parent: String,
    },
    /// Count work items per status
    Stats,
}

#[derive(Debug, serde::Serialize)]
pub struct WorkItemOutput {
    pub id: String,
    pub title: String,
    pub item_type: String,
    pub status: WorkStatus,
    pub priority: u8,
    pub attempts: u32,
    pub mode: String,
    pub parent_id: Option<String>,
    pub blocked_by: Vec<String>,
}

impl From<&WorkItem> for WorkItemOutput {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id.to_string(),
            title: item.title.clone(),
            item_type: item.item_type.clone(),
            status: item.status,
            priority: item.priority.value(),
            attempts: item.attempts,
            mode: mode_label(&item.context.execution_mode),
            parent_id: item.parent_task_id.map(|id| id.to_string()),
            blocked_by: item.blocked_by.iter().map(ToString::to_string).collect(),
        }
    }
}

fn mode_label(mode: &ExecutionMode) -> String {
    match mode {
        ExecutionMode::Direct => "direct".to_string(),
        ExecutionMode::Convergent {
            max_iterations: Some(max),
            ..
        } => format!("convergent({max})"),
        ExecutionMode::Convergent { .. } => "convergent".to_string(),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[derive(Debug, serde::Serialize)]
pub struct WorkItemListOutput {
    pub items: Vec<WorkItemOutput>,
    pub total: usize,
}

impl CommandOutput for WorkItemListOutput {
    fn to_human(&self) -> String {
        if self.items.is_empty() {
            return "No work items found.".to_string();
        }

        let mut table = table_with_header(&["ID", "TITLE", "TYPE", "STATUS", "PRI", "TRIES", "MODE"]);
        for item in &self.items {
            table.add_row(vec![
                Cell::new(short_id(&item.id)),
                Cell::new(truncate(&item.title, 40)),
                Cell::new(&item.item_type),
                status_cell(item.status),
                Cell::new(item.priority),
                Cell::new(item.attempts),
                Cell::new(&item.mode),
            ]);
        }
        format!("{table}\n\nShowing {} work item(s)", self.total)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct WorkItemDetailOutput {
    pub item: WorkItem,
}

impl CommandOutput for WorkItemDetailOutput {
    fn to_human(&self) -> String {
        let item = &self.item;
        let mut lines = vec![
            format!("Work item: {}", item.title),
            format!("  ID:          {}", item.id),
            format!("  Type:        {}", item.item_type),
            format!("  Status:      {}", item.status),
            format!("  Priority:    {}", item.priority),
            format!("  Attempts:    {}", item.attempts),
            format!("  Mode:        {}", mode_label(&item.context.execution_mode)),
            format!("  Created:     {}", item.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
        ];
        if let Some(started) = item.started_at {
            lines.push(format!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if let Some(completed) = item.completed_at {
            lines.push(format!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S UTC")));
        }
        if !item.total_execution_time.is_zero() {
            lines.push(format!("  Exec time:   {}", format_duration(item.total_execution_time)));
        }
        if let Some(elapsed) = item.total_elapsed_time {
            lines.push(format!("  Elapsed:     {}", format_duration(elapsed)));
        }
        if let Some(parent) = item.parent_task_id {
            lines.push(format!("  Parent:      {parent}"));
        }
        if !item.blocked_by.is_empty() {
            lines.push("  Blocked by:".to_string());
            for id in &item.blocked_by {
                lines.push(format!("    - {id}"));
            }
        }
        if let Some(reason) = &item.context.hold_reason {
            lines.push(format!("  Hold reason: {reason}"));
        }
        if let Some(error) = &item.error_message {
            lines.push(format!("  Last error:  {error}"));
        }
        if let Some(session) = &item.context.last_session {
            lines.push(format!(
                "  Last loop:   {} of {} iteration(s), {} error(s)",
                session.current_iteration,
                session.max_iterations,
                session.error_count()
            ));
        }
        if !item.description.is_empty() && item.description != item.title {
            lines.push(String::new());
            lines.push(item.description.clone());
        }
        if let Some(result) = &item.result {
            lines.push("\nResult:".to_string());
            lines.push(truncate(&result.content, 500));
            if let Some(session) = &result.session {
                lines.push(format!(
                    "  Converged after {} of {} iteration(s)",
                    session.current_iteration, session.max_iterations
                ));
            }
            if !result.files_changed.is_empty() {
                lines.push(format!("  Files changed: {}", result.files_changed.join(", ")));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, serde::Serialize)]
pub struct WorkItemActionOutput {
    pub success: bool,
    pub message: String,
    pub item: WorkItemOutput,
}

impl CommandOutput for WorkItemActionOutput {
    fn to_human(&self) -> String {
        format!("{}\n  ID: {}\n  Status: {}", self.message, self.item.id, self.item.status)
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SubtaskOutput {
    #[serde(flatten)]
    pub item: WorkItemOutput,
    pub ready: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct SubtaskListOutput {
    pub parent_id: String,
    pub subtasks: Vec<SubtaskOutput>,
    pub all_complete: bool,
}

impl CommandOutput for SubtaskListOutput {
    fn to_human(&self) -> String {
        if self.subtasks.is_empty() {
            return format!("Work item {} has no subtasks.", short_id(&self.parent_id));
        }

        let mut table = table_with_header(&["ID", "TITLE", "STATUS", "PRI", "READY", "BLOCKED BY"]);
        for sub in &self.subtasks {
            let blockers: Vec<&str> = sub.item.blocked_by.iter().map(|id| short_id(id)).collect();
            table.add_row(vec![
                Cell::new(short_id(&sub.item.id)),
                Cell::new(truncate(&sub.item.title, 40)),
                status_cell(sub.item.status),
                Cell::new(sub.item.priority),
                Cell::new(if sub.ready { "yes" } else { "no" }),
                Cell::new(blockers.join(", ")),
            ]);
        }
        let summary = if self.all_complete {
            "All subtasks completed."
        } else {
            "Subtasks still outstanding."
        };
        format!("{table}\n\n{summary}")
    }
}

#[derive(Debug, serde::Serialize)]
pub struct StatsOutput {
    pub counts: BTreeMap<String, u64>,
    pub total: u64,
}

impl CommandOutput for StatsOutput {
    fn to_human(&self) -> String {
        let mut lines = vec!["Queue status:".to_string()];
        for (status, count) in &self.counts {
            lines.push(format!("  {status:<10} {count}"));
        }
        lines.push(format!("  {:<10} {}", "total", self.total));
        lines.join("\n")
    }
}

pub async fn execute(args: TaskArgs, config: &Config, json_mode: bool) -> Result<()> {
    let (pool, store) = open_store(config).await?;
    let result = dispatch(args.command, &pool, store, json_mode).await;
    // Pending writes must reach the file before the process exits
    pool.close().await;
    result
}

async fn dispatch(
    command: TaskCommands,
    pool: &SqlitePool,
    store: Arc<SqliteWorkStore>,
    json_mode: bool,
) -> Result<()> {
    let service = WorkQueueService::new(Arc::clone(&store));

    match command {
        TaskCommands::Add {
            title,
            description,
            priority,
            item_type,
            parent,
            blocked_by,
            convergent,
            max_iterations,
            promise,
            extensions,
        } => {
            let mut item = WorkItem::new(title, description.unwrap_or_default())
                .with_type(item_type)
                .with_priority(Priority::new(priority)?);
            if let Some(parent) = parent {
                item = item.with_parent(resolve_work_item_id(pool, &parent).await?);
            }
            for blocker in resolve_ids(pool, &blocked_by).await? {
                item = item.blocked_by(blocker);
            }
            if convergent || max_iterations.is_some() || promise.is_some() {
                item = item.convergent(max_iterations, promise);
            }
            item.context.merge_extensions(parse_extensions(&extensions)?)?;

            let id = service.submit(item).await.context("Failed to add work item")?;
            let item = service.get(id).await?;
            let out = WorkItemActionOutput {
                success: true,
                message: "Work item added.".to_string(),
                item: WorkItemOutput::from(&item),
            };
            output(&out, json_mode);
        }
        TaskCommands::List {
            status,
            parent,
            item_type,
            limit,
        } => {
            let status = status
                .map(|s| WorkStatus::from_str(&s).ok_or_else(|| anyhow::anyhow!("Invalid status: {s}")))
                .transpose()?;
            let parent_task_id = match parent {
                Some(p) => Some(resolve_work_item_id(pool, &p).await?),
                None => None,
            };
            let items = service
                .list(WorkFilter {
                    status,
                    parent_task_id,
                    item_type,
                    limit: Some(limit),
                })
                .await?;
            let out = WorkItemListOutput {
                total: items.len(),
                items: items.iter().map(WorkItemOutput::from).collect(),
            };
            output(&out, json_mode);
        }
        TaskCommands::Show { id } => {
            let id = resolve_work_item_id(pool, &id).await?;
            let item = service.get(id).await?;
            output(&WorkItemDetailOutput { item }, json_mode);
        }
        TaskCommands::Hold { id, reason } => {
            let id = resolve_work_item_id(pool, &id).await?;
            let item = service.hold(id, &reason).await?;
            let out = WorkItemActionOutput {
                success: true,
                message: format!("Work item held: {reason}"),
                item: WorkItemOutput::from(&item),
            };
            output(&out, json_mode);
        }
        TaskCommands::Release { id } => {
            let id = resolve_work_item_id(pool, &id).await?;
            let item = service.release(id).await?;
            let out = WorkItemActionOutput {
                success: true,
                message: "Work item released.".to_string(),
                item: WorkItemOutput::from(&item),
            };
            output(&out, json_mode);
        }
        TaskCommands::Update {
            id,
            title,
            description,
            priority,
            item_type,
            blocked_by,
            clear_blocked_by,
            extensions,
        } => {
            let id = resolve_work_item_id(pool, &id).await?;
            let blocked_by = if clear_blocked_by {
                Some(BTreeSet::new())
            } else {
                match blocked_by {
                    Some(ids) => Some(resolve_ids(pool, &ids).await?),
                    None => None,
                }
            };
            let patch = WorkItemPatch {
                item_type,
                title,
                description,
                priority: priority.map(Priority::new).transpose()?,
                blocked_by,
                extensions: parse_extensions(&extensions)?,
                ..Default::default()
            };
            if patch == WorkItemPatch::default() {
                bail!("At least one field must be specified (--title, --description, --priority, --type, --blocked-by, --clear-blocked-by, or --set)");
            }

            let item = service.update(id, patch).await?;
            let out = WorkItemActionOutput {
                success: true,
                message: "Work item updated.".to_string(),
                item: WorkItemOutput::from(&item),
            };
            output(&out, json_mode);
        }
        TaskCommands::Subtasks { parent } => {
            let parent_id = resolve_work_item_id(pool, &parent).await?;
            let resolver = DependencyResolver::new(Arc::clone(&store));
            let subtasks = resolver.subtasks(parent_id).await?;

            let blocker_ids: Vec<Uuid> = subtasks.iter().flat_map(|s| s.blocked_by.iter().copied()).collect();
            let statuses = service.store().statuses(&blocker_ids).await?;
            let out = SubtaskListOutput {
                parent_id: parent_id.to_string(),
                all_complete: subtasks.iter().all(|s| s.status == WorkStatus::Completed),
                subtasks: subtasks
                    .iter()
                    .map(|s| SubtaskOutput {
                        item: WorkItemOutput::from(s),
                        ready: s.status == WorkStatus::Pending && is_ready(s, &statuses),
                    })
                    .collect(),
            };
            output(&out, json_mode);
        }
        TaskCommands::Stats => {
            let counts = service.counts().await?;
            let out = StatsOutput {
                total: counts.values().sum(),
                counts: counts.into_iter().map(|(status, n)| (status.as_str().to_string(), n)).collect(),
            };
            output(&out, json_mode);
        }
    }

    Ok(())
}

async fn resolve_ids(pool: &SqlitePool, prefixes: &[String]) -> Result<BTreeSet<Uuid>> {
    let mut ids = BTreeSet::new();
    for prefix in prefixes.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        ids.insert(resolve_work_item_id(pool, prefix).await?);
    }
    Ok(ids)
}

/// Parse `key=value` pairs. Values that parse as JSON are stored as JSON,
/// anything else as a string.
fn parse_extensions(pairs: &[String]) -> Result<BTreeMap<String, serde_json::Value>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Invalid --set entry '{pair}': expected key=value"))?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}
