//! Configuration management for the job tracking library

use crate::error::{JobError, Result};
use crate::retry::RetryPolicy;
use crate::stages::StageTotalsPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "MEDIA_JOBS";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub jobs: JobDefaults,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Defaults applied to jobs created without explicit settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobDefaults {
    pub default_priority: u8,
    pub timeout_minutes: u32,
    pub max_retry_attempts: u32,
    /// A running job without progress for this long is considered stale
    pub stale_after_minutes: u32,
    pub initial_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    pub backoff_multiplier: f64,
    pub stage_totals: StageTotalsPolicy,
    pub event_capacity: usize,
    /// Sealed run records kept per schedule; 0 keeps all of them
    pub history_limit: usize,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            default_priority: 5,
            timeout_minutes: 60,
            max_retry_attempts: 3,
            stale_after_minutes: 15,
            initial_retry_delay_secs: 1,
            max_retry_delay_secs: 300, // 5 minutes
            backoff_multiplier: 2.0,
            stage_totals: StageTotalsPolicy::Lenient,
            event_capacity: 1000,
            history_limit: 100,
        }
    }
}

impl JobDefaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(self.initial_retry_delay_secs),
            max_delay: Duration::from_secs(self.max_retry_delay_secs),
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stale_after_minutes))
    }

    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.timeout_minutes))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON document per resumable job
    pub state_directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("media-jobs");

        Self {
            state_directory: base_dir.join("state"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write daily rolling log files here when set
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_prefix: "media-jobs.log".to_string(),
            ansi: true,
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid by the TOML file at `path` (if present), overlaid by
    /// `MEDIA_JOBS__SECTION__KEY` environment variables
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        Self::layered(
            path,
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    fn layered(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let defaults = config::Config::try_from(&AppConfig::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(environment)
            .build()
            .map_err(config_error)?;
        let config: AppConfig = settings.try_deserialize().map_err(config_error)?;

        tracing::debug!("Layered configuration resolved: {:?}", config);
        Ok(config)
    }
}

fn config_error(e: config::ConfigError) -> JobError {
    JobError::config(format!("Failed to resolve configuration: {}", e))
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Create a configuration manager with a custom path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Replace the configuration and persist it
    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobError::config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config_str = toml::to_string_pretty(&self.config)
            .map_err(|e| JobError::config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, config_str)
            .map_err(|e| JobError::config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Configuration saved to {:?}", self.config_path);
        Ok(())
    }

    /// `<config dir>/media-jobs/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| JobError::config("Could not determine config directory"))?
            .join("media-jobs");

        Ok(config_dir.join("config.toml"))
    }

    fn load_or_create_config(path: &Path) -> Result<AppConfig> {
        if path.exists() {
            let config_str = std::fs::read_to_string(path)
                .map_err(|e| JobError::config(format!("Failed to read config file: {}", e)))?;

            let config: AppConfig = toml::from_str(&config_str)
                .map_err(|e| JobError::config(format!("Failed to parse config file: {}", e)))?;

            tracing::info!("Configuration loaded from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("Using default configuration");
            Ok(AppConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_configs() {
        let config = AppConfig::default();
        assert_eq!(config.jobs.default_priority, 5);
        assert_eq!(config.jobs.timeout_minutes, 60);
        assert_eq!(config.jobs.max_retry_attempts, 3);
        assert_eq!(config.jobs.retry_policy(), RetryPolicy::default());
        assert_eq!(config.jobs.stale_after(), chrono::Duration::minutes(15));
        assert_eq!(config.jobs.history_limit, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_manager_creation() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let manager = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(manager.config(), &AppConfig::default());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut manager = ConfigManager::with_path(config_path.clone()).unwrap();
        let mut config = manager.config().clone();
        config.jobs.timeout_minutes = 90;
        config.jobs.stage_totals = StageTotalsPolicy::Strict;
        manager.update_config(config).unwrap();

        let reloaded = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(reloaded.config().jobs.timeout_minutes, 90);
        assert_eq!(reloaded.config().jobs.stage_totals, StageTotalsPolicy::Strict);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[jobs]\nmax_retry_attempts = 7\n").unwrap();

        let manager = ConfigManager::with_path(config_path).unwrap();
        assert_eq!(manager.config().jobs.max_retry_attempts, 7);
        assert_eq!(manager.config().jobs.timeout_minutes, 60);
    }

    #[test]
    fn test_layered_environment_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "[jobs]\ntimeout_minutes = 30\nmax_retry_attempts = 5\n",
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert(
            "MEDIA_JOBS__JOBS__TIMEOUT_MINUTES".to_string(),
            "45".to_string(),
        );
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .source(Some(env));

        let config = AppConfig::layered(Some(&config_path), environment).unwrap();
        assert_eq!(config.jobs.timeout_minutes, 45);
        assert_eq!(config.jobs.max_retry_attempts, 5);
        assert_eq!(config.jobs.default_priority, 5);
    }

    #[test]
    fn test_layered_without_file() {
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(Some(HashMap::new()));
        let config = AppConfig::layered(None, environment).unwrap();
        assert_eq!(config.jobs, JobDefaults::default());
    }
}
