//! Resumable per-item processing state for file processing jobs
//!
//! Workers report each image exactly once as completed, failed or skipped.
//! Reports are idempotent per image id, so a worker that crashed mid-batch can
//! replay the batch after a restart without double counting.

use crate::error::{JobError, Result};
use crate::ledger::{ItemLedger, ItemOutcome};
use crate::models::{progress_percent, ErrorKind, ErrorSummary, JobId, JobSettings, RecordMeta, Revision};
use crate::state_machine::{JobAction, JobStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What a file processing job produces
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessingJobType {
    Cache,
    Thumbnail,
    Both,
    Other(String),
}

impl fmt::Display for ProcessingJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingJobType::Cache => write!(f, "cache"),
            ProcessingJobType::Thumbnail => write!(f, "thumbnail"),
            ProcessingJobType::Both => write!(f, "both"),
            ProcessingJobType::Other(name) => f.write_str(name),
        }
    }
}

impl From<String> for ProcessingJobType {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "cache" => ProcessingJobType::Cache,
            "thumbnail" => ProcessingJobType::Thumbnail,
            "both" => ProcessingJobType::Both,
            _ => ProcessingJobType::Other(value),
        }
    }
}

impl From<&str> for ProcessingJobType {
    fn from(value: &str) -> Self {
        ProcessingJobType::from(value.to_string())
    }
}

impl From<ProcessingJobType> for String {
    fn from(job_type: ProcessingJobType) -> String {
        job_type.to_string()
    }
}

/// Resumable state of a job that processes a known set of images
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumableProcessingState {
    job_id: JobId,
    job_type: ProcessingJobType,
    collection_id: Uuid,
    job_settings: JobSettings,
    status: JobStatus,
    #[serde(flatten)]
    ledger: ItemLedger,
    total_images: u64,
    completed_images: u64,
    failed_images: u64,
    skipped_images: u64,
    total_size_bytes: u64,
    current_image_id: Option<String>,
    can_resume: bool,
    has_errors: bool,
    error_summary: ErrorSummary,
    dummy_entries_created: u64,
    last_error: Option<String>,
    last_progress_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    meta: RecordMeta,
}

impl ResumableProcessingState {
    pub fn new(
        job_id: JobId,
        job_type: ProcessingJobType,
        collection_id: Uuid,
        total_images: u64,
        job_settings: JobSettings,
    ) -> Self {
        Self {
            job_id,
            job_type,
            collection_id,
            job_settings,
            status: JobStatus::Pending,
            ledger: ItemLedger::new(),
            total_images,
            completed_images: 0,
            failed_images: 0,
            skipped_images: 0,
            total_size_bytes: 0,
            current_image_id: None,
            can_resume: true,
            has_errors: false,
            error_summary: ErrorSummary::new(),
            dummy_entries_created: 0,
            last_error: None,
            last_progress_at: None,
            started_at: None,
            completed_at: None,
            meta: RecordMeta::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &ProcessingJobType {
        &self.job_type
    }

    pub fn collection_id(&self) -> Uuid {
        self.collection_id
    }

    pub fn job_settings(&self) -> &JobSettings {
        &self.job_settings
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn total_images(&self) -> u64 {
        self.total_images
    }

    pub fn completed_images(&self) -> u64 {
        self.completed_images
    }

    pub fn failed_images(&self) -> u64 {
        self.failed_images
    }

    pub fn skipped_images(&self) -> u64 {
        self.skipped_images
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.total_size_bytes
    }

    pub fn current_image_id(&self) -> Option<&str> {
        self.current_image_id.as_deref()
    }

    pub fn can_resume(&self) -> bool {
        self.can_resume
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn error_summary(&self) -> &ErrorSummary {
        &self.error_summary
    }

    pub fn dummy_entries_created(&self) -> u64 {
        self.dummy_entries_created
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_progress_at(&self) -> Option<DateTime<Utc>> {
        self.last_progress_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn revision(&self) -> Revision {
        self.meta.revision()
    }

    pub fn ledger(&self) -> &ItemLedger {
        &self.ledger
    }

    pub fn is_processed(&self, image_id: &str) -> bool {
        self.ledger.outcome(image_id) == Some(ItemOutcome::Processed)
    }

    pub fn is_failed(&self, image_id: &str) -> bool {
        self.ledger.outcome(image_id) == Some(ItemOutcome::Failed)
    }

    /// Images already handled in any way, so a resumed worker can skip them
    pub fn is_handled(&self, image_id: &str) -> bool {
        self.ledger.contains(image_id)
    }

    pub fn start(&mut self) -> Result<Revision> {
        let next = self.check(JobAction::Start)?;
        let now = Utc::now();
        self.status = next;
        self.started_at = Some(now);
        self.last_progress_at = Some(now);

        tracing::info!(
            "Processing job {} ({}) started for collection {} with {} images",
            self.job_id,
            self.job_type,
            self.collection_id,
            self.total_images
        );
        Ok(self.meta.touch())
    }

    pub fn pause(&mut self) -> Result<Revision> {
        self.status = self.check(JobAction::Pause)?;
        tracing::info!("Processing job {} paused at {}%", self.job_id, self.get_progress());
        Ok(self.meta.touch())
    }

    pub fn resume(&mut self) -> Result<Revision> {
        self.status = self.check(JobAction::Resume)?;
        if !self.can_resume {
            tracing::warn!("Processing job {} resumed with resume disabled", self.job_id);
        }
        self.last_progress_at = Some(Utc::now());
        tracing::info!(
            "Processing job {} resumed with {} images remaining",
            self.job_id,
            self.get_remaining_images()
        );
        Ok(self.meta.touch())
    }

    /// Finish the job; it will never be resumed afterwards
    pub fn complete(&mut self) -> Result<Revision> {
        let action = if self.has_errors {
            JobAction::CompleteWithErrors
        } else {
            JobAction::Complete
        };
        self.status = self.check(action)?;
        self.finalize();

        tracing::info!(
            "Processing job {} completed: {} processed, {} failed, {} skipped",
            self.job_id,
            self.completed_images,
            self.failed_images,
            self.skipped_images
        );
        Ok(self.meta.touch())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<Revision> {
        self.status = self.check(JobAction::Fail)?;
        let message = message.into();
        tracing::error!("Processing job {} failed: {}", self.job_id, message);

        self.last_error = Some(message);
        self.has_errors = true;
        self.finalize();
        Ok(self.meta.touch())
    }

    pub fn cancel(&mut self) -> Result<Revision> {
        self.status = self.check(JobAction::Cancel)?;
        self.finalize();
        tracing::info!("Processing job {} cancelled", self.job_id);
        Ok(self.meta.touch())
    }

    /// Record a successfully processed image; `Ok(false)` if it was already recorded
    pub fn increment_completed(&mut self, image_id: &str, size_bytes: u64) -> Result<bool> {
        if !self.try_record(image_id, ItemOutcome::Processed)? {
            return Ok(false);
        }
        self.completed_images += 1;
        self.total_size_bytes = self.total_size_bytes.saturating_add(size_bytes);
        Ok(true)
    }

    /// Record a permanently failed image; `Ok(false)` if it was already recorded
    pub fn increment_failed(&mut self, image_id: &str) -> Result<bool> {
        if !self.try_record(image_id, ItemOutcome::Failed)? {
            return Ok(false);
        }
        self.failed_images += 1;
        Ok(true)
    }

    /// Record an image finished by an earlier run; `Ok(false)` if it was already recorded
    pub fn increment_skipped(&mut self, image_id: &str) -> Result<bool> {
        if !self.try_record(image_id, ItemOutcome::Skipped)? {
            return Ok(false);
        }
        self.skipped_images += 1;
        Ok(true)
    }

    pub fn set_current_image(&mut self, image_id: impl Into<String>) -> Result<Revision> {
        self.check(JobAction::UpdateProgress)?;
        self.current_image_id = Some(image_id.into());
        Ok(self.meta.touch())
    }

    /// Count a placeholder result substituted for an image that could not be processed
    pub fn track_error(&mut self, kind: ErrorKind) -> Revision {
        let count = self.error_summary.record(kind.clone());
        self.dummy_entries_created += 1;
        self.has_errors = true;

        tracing::debug!(
            "Processing job {} tracked {} (x{}), {} placeholder entries",
            self.job_id,
            kind,
            count,
            self.dummy_entries_created
        );
        self.meta.touch()
    }

    /// Keep the latest human-readable error for diagnostics
    pub fn record_error_message(&mut self, message: impl Into<String>) -> Revision {
        self.last_error = Some(message.into());
        self.has_errors = true;
        self.meta.touch()
    }

    /// Permanently opt this job out of crash recovery
    pub fn disable_resume(&mut self) -> Revision {
        if self.can_resume {
            tracing::info!("Resume disabled for processing job {}", self.job_id);
        }
        self.can_resume = false;
        self.meta.touch()
    }

    /// Handled share of all images, truncated
    pub fn get_progress(&self) -> u8 {
        progress_percent(self.handled_images(), self.total_images)
    }

    pub fn get_remaining_images(&self) -> u64 {
        self.total_images.saturating_sub(self.handled_images())
    }

    pub fn get_error_summary_string(&self) -> String {
        self.error_summary.to_string()
    }

    pub fn handled_images(&self) -> u64 {
        self.completed_images + self.failed_images + self.skipped_images
    }

    /// No progress reported within `threshold` while the job claims to be running
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        match self.last_progress_at {
            Some(last) => now - last > threshold,
            None => true,
        }
    }

    /// A crash-recovery path may pick this job up again
    pub fn is_recoverable(&self) -> bool {
        self.can_resume && self.status.is_active()
    }

    fn try_record(&mut self, image_id: &str, outcome: ItemOutcome) -> Result<bool> {
        self.check(JobAction::UpdateProgress)?;
        if image_id.is_empty() {
            return Err(JobError::invalid_input("Image id must not be empty"));
        }
        if self.ledger.contains(image_id) {
            tracing::debug!(
                "Processing job {} ignored duplicate report for image {}",
                self.job_id,
                image_id
            );
            return Ok(false);
        }
        if self.handled_images() >= self.total_images {
            return Err(JobError::invalid_input(format!(
                "Processing job {} already accounts for all {} images",
                self.job_id, self.total_images
            )));
        }

        self.ledger.record(image_id, outcome);
        self.current_image_id = Some(image_id.to_string());
        self.last_progress_at = Some(Utc::now());
        self.meta.touch();
        Ok(true)
    }

    fn finalize(&mut self) {
        self.completed_at = Some(Utc::now());
        self.can_resume = false;
        self.current_image_id = None;
    }

    fn check(&self, action: JobAction) -> Result<JobStatus> {
        self.status.apply(action).map_err(|e| {
            tracing::warn!("Processing job {} rejected transition: {}", self.job_id, e);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(total: u64) -> ResumableProcessingState {
        let settings = JobSettings::new(serde_json::json!({"width": 320, "quality": 80}));
        let mut state = ResumableProcessingState::new(
            Uuid::new_v4(),
            ProcessingJobType::Thumbnail,
            Uuid::new_v4(),
            total,
            settings,
        );
        state.start().unwrap();
        state
    }

    #[test]
    fn test_resume_arithmetic() {
        let mut state = state(10);
        for i in 0..6 {
            assert!(state.increment_completed(&format!("img-{}", i), 100).unwrap());
        }
        state.increment_failed("img-6").unwrap();
        state.increment_failed("img-7").unwrap();

        assert_eq!(state.get_remaining_images(), 2);
        assert_eq!(state.get_progress(), 80);
        assert_eq!(state.total_size_bytes(), 600);
    }

    #[test]
    fn test_duplicate_reports_are_ignored() {
        let mut state = state(5);
        assert!(state.increment_completed("img-1", 2048).unwrap());
        let revision = state.revision();

        assert!(!state.increment_completed("img-1", 2048).unwrap());
        assert!(!state.increment_failed("img-1").unwrap());
        assert!(!state.increment_skipped("img-1").unwrap());

        assert_eq!(state.completed_images(), 1);
        assert_eq!(state.failed_images(), 0);
        assert_eq!(state.total_size_bytes(), 2048);
        assert_eq!(state.revision(), revision);
        assert!(state.is_processed("img-1"));
        assert!(!state.is_failed("img-1"));
    }

    #[test]
    fn test_skipped_images_count_towards_progress() {
        let mut state = state(4);
        state.increment_skipped("a").unwrap();
        state.increment_skipped("b").unwrap();
        state.increment_completed("c", 1).unwrap();
        assert_eq!(state.get_progress(), 75);
        assert_eq!(state.get_remaining_images(), 1);
        assert!(state.is_handled("a"));
    }

    #[test]
    fn test_cannot_exceed_total() {
        let mut state = state(1);
        state.increment_completed("a", 1).unwrap();
        assert!(matches!(
            state.increment_completed("b", 1),
            Err(JobError::InvalidInput { .. })
        ));
        assert_eq!(state.get_progress(), 100);
    }

    #[test]
    fn test_track_error_updates_summary() {
        let mut state = state(10);
        for _ in 0..3 {
            state.track_error(ErrorKind::DecodeError);
        }
        state.track_error(ErrorKind::Timeout);

        assert!(state.has_errors());
        assert_eq!(state.dummy_entries_created(), 4);
        assert_eq!(state.get_error_summary_string(), "DecodeError: 3, Timeout: 1");
    }

    #[test]
    fn test_finalized_jobs_cannot_resume() {
        let mut state = state(3);
        state.increment_completed("a", 1).unwrap();
        state.pause().unwrap();
        assert!(state.is_recoverable());
        state.resume().unwrap();
        state.cancel().unwrap();

        assert!(!state.can_resume());
        assert!(!state.is_recoverable());
        assert!(state.increment_completed("b", 1).unwrap_err().is_invalid_transition());
    }

    #[test]
    fn test_disable_resume_is_one_way() {
        let mut state = state(3);
        state.disable_resume();
        state.disable_resume();
        assert!(!state.can_resume());
        assert!(!state.is_recoverable());
        assert_eq!(state.status(), JobStatus::Running);
    }

    #[test]
    fn test_complete_with_errors() {
        let mut state = state(2);
        state.increment_completed("a", 1).unwrap();
        state.increment_failed("b").unwrap();
        state.track_error(ErrorKind::Corrupted);
        state.complete().unwrap();

        assert_eq!(state.status(), JobStatus::Completed);
        assert!(state.has_errors());
        assert!(state.completed_at().is_some());
        assert!(!state.can_resume());
    }

    #[test]
    fn test_staleness() {
        let state = state(3);
        let now = Utc::now();
        assert!(!state.is_stale(now, Duration::minutes(15)));
        assert!(state.is_stale(now + Duration::minutes(16), Duration::minutes(15)));
    }

    #[test]
    fn test_document_round_trip() {
        let mut state = state(3);
        state.increment_completed("a", 10).unwrap();
        state.increment_failed("b").unwrap();
        state.track_error(ErrorKind::DecodeError);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["job_type"], "thumbnail");
        assert_eq!(json["processed_image_ids"], serde_json::json!(["a"]));
        assert_eq!(json["failed_image_ids"], serde_json::json!(["b"]));
        assert_eq!(json["error_summary"], serde_json::json!({"DecodeError": 1}));
        assert_eq!(json["job_settings"]["quality"], 80);

        let restored: ResumableProcessingState = serde_json::from_value(json).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.get_progress(), 66);
    }
}
