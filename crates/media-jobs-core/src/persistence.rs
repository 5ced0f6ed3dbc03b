//! Durable storage for resumable processing state

use crate::error::Result;
use crate::models::JobId;
use crate::resumable::ResumableProcessingState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

/// Storage backend for resumable job state
#[async_trait]
pub trait JobStateStore: Send + Sync + std::fmt::Debug {
    async fn save(&self, state: &ResumableProcessingState) -> Result<()>;

    async fn load(&self, job_id: JobId) -> Result<Option<ResumableProcessingState>>;

    async fn remove(&self, job_id: JobId) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<ResumableProcessingState>>;

    /// States a crash-recovery pass may pick up again
    async fn recoverable(&self) -> Result<Vec<ResumableProcessingState>> {
        let states = self.load_all().await?;
        Ok(states.into_iter().filter(|s| s.is_recoverable()).collect())
    }
}

/// One pretty JSON document per job under a directory
#[derive(Debug)]
pub struct FileJobStore {
    storage_path: PathBuf,
    cache: Arc<RwLock<HashMap<JobId, ResumableProcessingState>>>,
}

impl FileJobStore {
    /// Open a store, creating the directory if needed
    pub async fn new(storage_path: &Path) -> Result<Self> {
        if !storage_path.exists() {
            fs::create_dir_all(storage_path).await?;
            tracing::debug!("Created job store directory {}", storage_path.display());
        }

        Ok(Self {
            storage_path: storage_path.to_path_buf(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn job_file(&self, job_id: JobId) -> PathBuf {
        self.storage_path.join(format!("{}.json", job_id))
    }

    /// Read a single state document from disk
    pub async fn load_from_file(path: &Path) -> Result<ResumableProcessingState> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl JobStateStore for FileJobStore {
    async fn save(&self, state: &ResumableProcessingState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let job_file = self.job_file(state.job_id());
        // Write then rename so a crash never leaves a truncated document behind.
        let tmp_file = job_file.with_extension("json.tmp");
        fs::write(&tmp_file, json).await?;
        fs::rename(&tmp_file, &job_file).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(state.job_id(), state.clone());
        }

        tracing::debug!("Saved state of job {} (v{})", state.job_id(), state.revision().version);
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<ResumableProcessingState>> {
        {
            let cache = self.cache.read().await;
            if let Some(state) = cache.get(&job_id) {
                return Ok(Some(state.clone()));
            }
        }

        let job_file = self.job_file(job_id);
        if !job_file.exists() {
            return Ok(None);
        }

        let state = Self::load_from_file(&job_file).await?;
        {
            let mut cache = self.cache.write().await;
            cache.insert(job_id, state.clone());
        }
        Ok(Some(state))
    }

    async fn remove(&self, job_id: JobId) -> Result<()> {
        let job_file = self.job_file(job_id);
        if job_file.exists() {
            fs::remove_file(&job_file).await?;
        }

        {
            let mut cache = self.cache.write().await;
            cache.remove(&job_id);
        }

        tracing::debug!("Removed state of job {}", job_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ResumableProcessingState>> {
        let mut states = Vec::new();
        let mut dir = fs::read_dir(&self.storage_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                match Self::load_from_file(&path).await {
                    Ok(state) => states.push(state),
                    Err(e) => {
                        tracing::error!("Failed to load job state from {}: {}", path.display(), e);
                    }
                }
            }
        }

        {
            let mut cache = self.cache.write().await;
            for state in &states {
                cache.insert(state.job_id(), state.clone());
            }
        }

        Ok(states)
    }
}

/// Volatile store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    states: RwLock<HashMap<JobId, ResumableProcessingState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStateStore for MemoryJobStore {
    async fn save(&self, state: &ResumableProcessingState) -> Result<()> {
        self.states.write().await.insert(state.job_id(), state.clone());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<ResumableProcessingState>> {
        Ok(self.states.read().await.get(&job_id).cloned())
    }

    async fn remove(&self, job_id: JobId) -> Result<()> {
        self.states.write().await.remove(&job_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ResumableProcessingState>> {
        Ok(self.states.read().await.values().cloned().collect())
    }
}
