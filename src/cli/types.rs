//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::commands::init::InitArgs;
use crate::cli::commands::run::RunArgs;
use crate::cli::commands::task::TaskArgs;
use crate::cli::commands::validate::ValidateArgs;

#[derive(Parser, Debug)]
#[command(name = "taskloop")]
#[command(about = "taskloop - priority work queue with convergent execution", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file (replaces .taskloop/config.yaml and local.yaml)
    #[arg(long, global = true, env = "TASKLOOP_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the .taskloop directory, configuration and database
    Init(InitArgs),

    /// Work item management commands
    Task(TaskArgs),

    /// Check a prompt for completion criteria
    Validate(ValidateArgs),

    /// Run worker loops against the queue
    Run(RunArgs),
}
