//! Command-line interface for inspecting persisted media job state

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use media_jobs_core::{
    init_logging_with_config, version, AppConfig, ConfigManager, FileJobStore, JobStateStore,
    ResumableProcessingState,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "media-jobs")]
#[command(about = "Inspect background and scheduled job state of a media library")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version and resolved configuration
    Info,

    /// Print a persisted processing state document
    Inspect {
        /// Path to a job state JSON file
        file: PathBuf,
    },

    /// List jobs that can be resumed after a crash
    Recoverable {
        /// State directory (defaults to the configured one)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => ConfigManager::default_config_path().ok(),
    };
    let mut config = AppConfig::load_layered(config_path.as_deref())
        .context("Failed to load configuration")?;

    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _guard = init_logging_with_config(&config.logging)?;

    info!("Media Jobs CLI v{} starting", version());

    match cli.command {
        Commands::Info => print_info(&config, config_path.as_deref()),
        Commands::Inspect { file } => inspect(&file).await?,
        Commands::Recoverable { dir } => {
            let dir = dir.unwrap_or_else(|| config.storage.state_directory.clone());
            list_recoverable(&dir, &config).await?;
        }
    }

    Ok(())
}

fn print_info(config: &AppConfig, config_path: Option<&Path>) {
    println!("Media Jobs v{}", version());
    println!("Background and scheduled job tracking for media libraries");
    println!("\nConfiguration:");
    match config_path {
        Some(path) => println!("  Config file: {}", path.display()),
        None => println!("  Config file: <none>"),
    }
    println!("  State directory: {}", config.storage.state_directory.display());
    println!("\nJob defaults:");
    println!("  Priority: {}", config.jobs.default_priority);
    println!("  Timeout: {} min", config.jobs.timeout_minutes);
    println!("  Max retries: {}", config.jobs.max_retry_attempts);
    println!("  Stale after: {} min", config.jobs.stale_after_minutes);
}

async fn inspect(file: &Path) -> Result<()> {
    debug!("Inspecting {}", file.display());
    let state = FileJobStore::load_from_file(file)
        .await
        .with_context(|| format!("Failed to read job state from {}", file.display()))?;
    print_state(&state);
    Ok(())
}

fn print_state(state: &ResumableProcessingState) {
    println!("Job: {}", state.job_id());
    println!("  Type: {}", state.job_type());
    println!("  Collection: {}", state.collection_id());
    println!("  Status: {}", state.status());
    println!("  Progress: {}%", state.get_progress());
    println!(
        "  Images: {} total, {} completed, {} failed, {} skipped, {} remaining",
        state.total_images(),
        state.completed_images(),
        state.failed_images(),
        state.skipped_images(),
        state.get_remaining_images()
    );
    println!("  Processed bytes: {}", state.total_size_bytes());
    println!("  Has errors: {}", state.has_errors());
    if !state.error_summary().is_empty() {
        println!("  Errors: {}", state.get_error_summary_string());
    }
    if let Some(last_error) = state.last_error() {
        println!("  Last error: {}", last_error);
    }
    println!("  Resumable: {}", state.is_recoverable());
}

async fn list_recoverable(dir: &Path, config: &AppConfig) -> Result<()> {
    let store = FileJobStore::new(dir)
        .await
        .with_context(|| format!("Failed to open state directory {}", dir.display()))?;
    let states = store.recoverable().await?;

    if states.is_empty() {
        println!("No recoverable jobs in {}", dir.display());
        return Ok(());
    }

    let now = Utc::now();
    let stale_after = config.jobs.stale_after();
    println!("{} recoverable job(s) in {}:", states.len(), dir.display());
    for state in &states {
        let stale = if state.is_stale(now, stale_after) { " (stale)" } else { "" };
        println!(
            "  {} {} {} {}% ({} remaining){}",
            state.job_id(),
            state.job_type(),
            state.status(),
            state.get_progress(),
            state.get_remaining_images(),
            stale
        );
    }
    Ok(())
}
