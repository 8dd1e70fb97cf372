//! Implementation of the `taskloop validate` command.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{Config, ValidationConfig, ValidationResult};
use crate::services::convergence_validator;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Prompt text to check
    #[arg(conflicts_with = "file")]
    pub prompt: Option<String>,

    /// Read the prompt from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Iteration cap supplied outside the prompt
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Accept implicit completion phrases such as "until done"
    #[arg(long)]
    pub lenient: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct ValidateOutput {
    #[serde(flatten)]
    pub result: ValidationResult,
}

impl CommandOutput for ValidateOutput {
    fn to_human(&self) -> String {
        let result = &self.result;
        let mut lines = Vec::new();
        if result.is_valid {
            lines.push(format!("Valid: completion by {}", result.completion_type.as_str()));
        } else {
            lines.push("Invalid: prompt has no completion criteria".to_string());
        }
        if let Some(promise) = &result.promise_text {
            lines.push(format!("  Promise:        {promise}"));
        }
        if let Some(max) = result.max_iterations {
            lines.push(format!("  Max iterations: {max}"));
        }
        if !result.success_criteria.is_empty() {
            lines.push("  Criteria:".to_string());
            lines.extend(result.success_criteria.iter().map(|c| format!("    - {c}")));
        }
        for error in &result.errors {
            lines.push(format!("  error: {error}"));
        }
        for warning in &result.warnings {
            lines.push(format!("  warning: {warning}"));
        }
        if !result.suggestions.is_empty() {
            lines.push("\nSuggestions:".to_string());
            lines.extend(result.suggestions.iter().map(|s| format!("  - {s}")));
        }
        lines.join("\n")
    }
}

/// Returns whether the prompt is valid so the caller can set the exit code.
pub async fn execute(args: ValidateArgs, config: &Config, json_mode: bool) -> Result<bool> {
    let prompt = match (args.prompt, args.file) {
        (Some(prompt), None) => prompt,
        (None, Some(path)) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read prompt from {}", path.display()))?,
        _ => bail!("Provide a prompt or --file"),
    };

    let validation = ValidationConfig {
        max_iterations: args.max_iterations,
        strict: config.convergence.strict && !args.lenient,
    };
    let result = convergence_validator::validate(&prompt, &validation);
    let valid = result.is_valid;
    output(&ValidateOutput { result }, json_mode);
    Ok(valid)
}
