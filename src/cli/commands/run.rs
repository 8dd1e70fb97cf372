//! Implementation of the `taskloop run` command.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use crate::adapters::executors::CommandExecutor;
use crate::cli::commands::open_store;
use crate::cli::id_resolver::resolve_work_item_id;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::services::{Scheduler, SchedulerStats, SubtaskReport};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Stop once no claimable work item is left
    #[arg(long, conflicts_with = "parent")]
    pub once: bool,

    /// Only run the subtasks of this parent (ID or unique prefix)
    #[arg(long)]
    pub parent: Option<String>,

    /// Number of worker loops (overrides scheduler.workers)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunOutput {
    Queue { stats: SchedulerStats },
    Subtasks { report: SubtaskReport },
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        match self {
            Self::Queue { stats } => format!(
                "Dispatched {} work item(s): {} completed, {} retrying, {} failed, {} held for review, {} rejected",
                stats.dispatched, stats.completed, stats.retried, stats.failed, stats.escalated, stats.rejected
            ),
            Self::Subtasks { report } => {
                let mut lines = vec![format!(
                    "Subtasks of {}: {} dispatched, {} completed, {} failed, {} held",
                    report.parent_id,
                    report.dispatched,
                    report.completed.len(),
                    report.failed.len(),
                    report.held.len()
                )];
                if !report.unready.is_empty() {
                    lines.push(format!("  {} subtask(s) still blocked", report.unready.len()));
                }
                if let Some(cycle) = &report.cycle {
                    let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
                    lines.push(format!("  Dependency cycle: {}", path.join(" -> ")));
                }
                if report.all_complete {
                    lines.push("  All subtasks completed.".to_string());
                }
                lines.join("\n")
            }
        }
    }
}

pub async fn execute(args: RunArgs, config: &Config, json_mode: bool) -> Result<()> {
    let mut config = config.clone();
    if let Some(workers) = args.workers {
        config.scheduler.workers = workers.max(1);
    }

    let (pool, store) = open_store(&config).await?;
    let executor = Arc::new(CommandExecutor::new(config.executor.clone()));
    let scheduler = Scheduler::new(Arc::clone(&store), executor, &config).context("Invalid scheduler configuration")?;

    let token = scheduler.cancellation_token();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            token.cancel();
        }
    });

    let result: Result<RunOutput> = async {
        Ok(match args.parent {
            Some(parent) => {
                let parent_id = resolve_work_item_id(&pool, &parent).await?;
                info!(%parent_id, "running subtasks");
                RunOutput::Subtasks {
                    report: scheduler.run_subtasks(parent_id).await?,
                }
            }
            None if args.once => RunOutput::Queue {
                stats: scheduler.run_until_idle().await?,
            },
            None => RunOutput::Queue {
                stats: scheduler.run().await?,
            },
        })
    }
    .await;
    signal_task.abort();
    pool.close().await;

    output(&result?, json_mode);
    Ok(())
}
