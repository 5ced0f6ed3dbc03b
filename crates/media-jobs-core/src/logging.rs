//! Logging configuration and initialization

use crate::config::LoggingConfig;
use crate::error::{JobError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ALREADY_SET: &str = "a global default trace dispatcher has already been set";

/// Initialize console logging on stderr, honouring `RUST_LOG`
pub fn init_logging() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    accept_existing(result)
}

/// Initialize logging from configuration
///
/// When `config.directory` is set, events are also written to a daily rolling
/// file through a non-blocking writer. Keep the returned guard alive for as
/// long as logs should be flushed.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| JobError::LoggingError {
            message: format!("Invalid log level '{}': {}", config.level, e),
        })?;

    // Console output goes to stderr so it never mixes with command output.
    let console = tracing_subscriber::fmt::layer()
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr);

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);

            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .with(file)
                .try_init();
            accept_existing(result)?;
            Ok(Some(guard))
        }
        None => {
            let result = tracing_subscriber::registry()
                .with(env_filter)
                .with(console)
                .try_init();
            accept_existing(result)?;
            Ok(None)
        }
    }
}

fn accept_existing(result: std::result::Result<(), tracing_subscriber::util::TryInitError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        // Another subscriber (tests, embedding application) already owns the global slot.
        Err(e) if e.to_string().contains(ALREADY_SET) => Ok(()),
        Err(e) => Err(JobError::LoggingError {
            message: format!("Failed to initialize logging: {}", e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_init_is_repeatable() {
        assert!(init_logging().is_ok());
        assert!(init_logging().is_ok());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "media_jobs=loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging_with_config(&config),
            Err(JobError::LoggingError { .. })
        ));
    }

    #[test]
    fn test_file_logging_returns_guard() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(temp_dir.path().to_path_buf()),
            ..LoggingConfig::default()
        };
        let guard = init_logging_with_config(&config).unwrap();
        assert!(guard.is_some());
    }
}
