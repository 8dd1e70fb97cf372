use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;
use crate::services::stuck_detection::RegexMatcher;

/// Project directory holding configuration and the database
pub const PROJECT_DIR: &str = ".taskloop";

/// Environment variable prefix; `__` separates nested keys
pub const ENV_PREFIX: &str = "TASKLOOP_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid workers: {0}. Must be at least 1")]
    InvalidWorkers(usize),

    #[error("Invalid subtask_concurrency: {0}. Must be at least 1")]
    InvalidSubtaskConcurrency(usize),

    #[error("Invalid iteration_timeout_secs: {0}. Must be at least 1")]
    InvalidIterationTimeout(u64),

    #[error("Invalid default_max_iterations: {0}. Must be at least 1")]
    InvalidMaxIterations(u32),

    #[error("Invalid stuck pattern: {0}")]
    InvalidStuckPattern(String),

    #[error("Executor command cannot be empty")]
    EmptyExecutorCommand,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .taskloop/config.yaml (project config, created by init)
    /// 3. .taskloop/local.yaml (project local overrides, optional)
    /// 4. Environment variables (TASKLOOP_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(Path::new(PROJECT_DIR).join("config.yaml")))
            .merge(Yaml::file(Path::new(PROJECT_DIR).join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file in place of the project
    /// files. Environment variables still take precedence.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        if config.scheduler.workers == 0 {
            return Err(ConfigError::InvalidWorkers(config.scheduler.workers));
        }
        if config.scheduler.subtask_concurrency == 0 {
            return Err(ConfigError::InvalidSubtaskConcurrency(
                config.scheduler.subtask_concurrency,
            ));
        }
        if config.scheduler.iteration_timeout_secs == 0 {
            return Err(ConfigError::InvalidIterationTimeout(
                config.scheduler.iteration_timeout_secs,
            ));
        }

        if config.convergence.default_max_iterations == 0 {
            return Err(ConfigError::InvalidMaxIterations(
                config.convergence.default_max_iterations,
            ));
        }
        for pattern in &config.convergence.stuck_patterns {
            RegexMatcher::new(pattern).map_err(|e| ConfigError::InvalidStuckPattern(e.to_string()))?;
        }

        if config.executor.command.trim().is_empty() {
            return Err(ConfigError::EmptyExecutorCommand);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, ".taskloop/taskloop.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.convergence.default_max_iterations, 10);
        assert!(config.convergence.require_completion_criteria);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
database:
  path: /custom/path.db
  max_connections: 8
scheduler:
  workers: 4
  max_retries: 5
convergence:
  default_max_iterations: 20
  completion_promise: TESTS_GREEN
  stuck_patterns:
    - 'waiting for (review|approval)'
executor:
  command: my-agent
  args: ['--batch']
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");
        assert_eq!(config.database.path, "/custom/path.db");
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.scheduler.max_retries, 5);
        // Unset keys keep their defaults
        assert_eq!(config.scheduler.poll_interval_ms, 2_000);
        assert_eq!(config.convergence.completion_promise.as_deref(), Some("TESTS_GREEN"));
        assert_eq!(config.executor.args, vec!["--batch"]);
        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyDatabasePath)
        ));
    }

    #[test]
    fn test_validate_scheduler_bounds() {
        let mut config = Config::default();
        config.scheduler.workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWorkers(0))
        ));

        let mut config = Config::default();
        config.scheduler.iteration_timeout_secs = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidIterationTimeout(0))
        ));

        let mut config = Config::default();
        config.scheduler.subtask_concurrency = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidSubtaskConcurrency(0))
        ));
    }

    #[test]
    fn test_validate_convergence_settings() {
        let mut config = Config::default();
        config.convergence.default_max_iterations = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxIterations(0))
        ));

        let mut config = Config::default();
        config.convergence.stuck_patterns = vec!["(unclosed".to_string()];
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidStuckPattern(_))
        ));
    }

    #[test]
    fn test_validate_empty_executor_command() {
        let mut config = Config::default();
        config.executor.command = "  ".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyExecutorCommand)
        ));
    }

    #[test]
    fn test_load_from_file_with_env_override() {
        let file = yaml_file("scheduler:\n  workers: 3\nlogging:\n  level: warn\n  format: json\n");

        let config = temp_env::with_vars(
            [
                ("TASKLOOP_SCHEDULER__WORKERS", Some("6")),
                ("TASKLOOP_CONVERGENCE__STRICT", Some("false")),
            ],
            || ConfigLoader::load_from_file(file.path()).unwrap(),
        );

        assert_eq!(config.scheduler.workers, 6, "Environment should win");
        assert!(!config.convergence.strict);
        assert_eq!(config.logging.level, "warn", "File value should persist");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_load_from_missing_file() {
        assert!(ConfigLoader::load_from_file("/nonexistent/taskloop.yaml").is_err());
    }

    #[test]
    fn test_load_from_file_rejects_invalid_values() {
        let file = yaml_file("scheduler:\n  workers: 0\n");
        let err = ConfigLoader::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_hierarchical_merging() {
        let base_file = yaml_file("scheduler:\n  workers: 5\nlogging:\n  level: info\n  format: json\n");
        let override_file = yaml_file("scheduler:\n  workers: 2\nlogging:\n  level: debug\n");

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.scheduler.workers, 2, "Override should win");
        assert_eq!(config.logging.level, "debug", "Override should win for nested fields");
        assert_eq!(config.logging.format, "json", "Base value should persist when not overridden");
    }
}
