//! # Media Jobs Core
//!
//! Lifecycle, progress and run-history tracking for the background and
//! scheduled jobs of a media library: thumbnail and cache generation,
//! collection scans and periodic maintenance.
//!
//! The records in this crate are plain values with validated mutators;
//! [`JobCoordinator`] ties them together for an in-process scheduler and its
//! workers, and [`JobStateStore`] persists resumable processing state.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod job_run;
pub mod ledger;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod resumable;
pub mod retry;
pub mod run_history;
pub mod schedule;
pub mod stages;
pub mod state_machine;

// Re-export commonly used types
pub use config::{AppConfig, ConfigManager, JobDefaults, LoggingConfig, StorageConfig};
pub use coordinator::{IntervalCalculator, JobCoordinator, JobEvent, NextRunCalculator};
pub use error::{JobError, Result};
pub use job_run::JobRun;
pub use ledger::{ItemLedger, ItemOutcome};
pub use logging::{init_logging, init_logging_with_config};
pub use models::*;
pub use persistence::{FileJobStore, JobStateStore, MemoryJobStore};
pub use resumable::{ProcessingJobType, ResumableProcessingState};
pub use retry::RetryPolicy;
pub use run_history::RunHistory;
pub use schedule::{ScheduleDefinition, ScheduleSpec, ScheduleType};
pub use stages::{Stage, StageStatus, StageTotalsPolicy, StageTracker};
pub use state_machine::{JobAction, JobStatus, RunStatus};

/// Initialize the media jobs core library
pub async fn init() -> Result<()> {
    logging::init_logging()?;

    tracing::info!("Media Jobs Core {} initialized", version());
    Ok(())
}

/// Get the version of the media jobs core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init() {
        let result = init().await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
    }
}
