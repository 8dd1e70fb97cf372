//! taskloop CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use taskloop::cli::commands::{init, run, task, validate};
use taskloop::cli::{handle_error, Cli, Commands};
use taskloop::infrastructure::logging::LoggerImpl;
use taskloop::ConfigLoader;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => handle_error(err, cli.json),
    };

    // Held until exit so buffered file logs are flushed
    let _logger = match LoggerImpl::init(&config.logging) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Init(args) => init::execute(args, cli.json).await.map(|()| true),
        Commands::Task(args) => task::execute(args, &config, cli.json).await.map(|()| true),
        Commands::Validate(args) => validate::execute(args, &config, cli.json).await,
        Commands::Run(args) => run::execute(args, &config, cli.json).await.map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => handle_error(err, cli.json),
    }
}
