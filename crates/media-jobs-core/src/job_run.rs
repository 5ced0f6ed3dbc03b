//! Background job run: lifecycle, progress and multi-stage aggregation

use crate::error::{JobError, Result};
use crate::models::{
    progress_percent, validate_counts, JobId, JobParameters, JobPriority, RecordMeta, Revision,
};
use crate::retry::RetryPolicy;
use crate::stages::{StageTotalsPolicy, StageTracker};
use crate::state_machine::{JobAction, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One execution of a background job
///
/// Mutators validate first and write second: a call that returns an error
/// leaves every field, including the revision, untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    id: JobId,
    job_type: String,
    resource_id: Option<Uuid>,
    status: JobStatus,
    progress: u8,
    total_items: u64,
    completed_items: u64,
    current_item: Option<String>,
    message: Option<String>,
    errors: Vec<String>,
    has_errors: bool,
    result: Option<serde_json::Value>,
    parameters: JobParameters,
    stages: Option<StageTracker>,
    priority: JobPriority,
    retry_count: u32,
    max_retries: u32,
    expires_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    meta: RecordMeta,
}

impl JobRun {
    /// Create a pending run for `job_type`
    pub fn new(job_type: impl Into<String>, parameters: JobParameters) -> Result<Self> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(JobError::config("Job type must not be empty"));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            job_type,
            resource_id: None,
            status: JobStatus::Pending,
            progress: 0,
            total_items: 0,
            completed_items: 0,
            current_item: None,
            message: None,
            errors: Vec::new(),
            has_errors: false,
            result: None,
            parameters,
            stages: None,
            priority: JobPriority::default(),
            retry_count: 0,
            max_retries: 0,
            expires_at: None,
            started_at: None,
            completed_at: None,
            meta: RecordMeta::new(),
        })
    }

    /// Link the run to the collection or resource it works on
    pub fn with_resource(mut self, resource_id: Uuid) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_limit(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Use a non-default totals policy for stages added later
    pub fn with_stage_policy(mut self, policy: StageTotalsPolicy) -> Self {
        self.stages = Some(StageTracker::with_policy(policy));
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn resource_id(&self) -> Option<Uuid> {
        self.resource_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    pub fn completed_items(&self) -> u64 {
        self.completed_items
    }

    pub fn current_item(&self) -> Option<&str> {
        self.current_item.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn stages(&self) -> Option<&StageTracker> {
        self.stages.as_ref()
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    pub fn revision(&self) -> Revision {
        self.meta.revision()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_multi_stage(&self) -> bool {
        self.stages.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Wall-clock time between start and completion
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    /// Time spent running so far, or in total once finished
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or(now) - started)
    }

    pub fn start(&mut self) -> Result<Revision> {
        let next = self.check(JobAction::Start)?;
        self.status = next;
        self.started_at = Some(Utc::now());

        tracing::info!("Job {} ({}) started", self.id, self.job_type);
        Ok(self.meta.touch())
    }

    pub fn pause(&mut self) -> Result<Revision> {
        self.status = self.check(JobAction::Pause)?;
        tracing::info!("Job {} paused at {}%", self.id, self.progress);
        Ok(self.meta.touch())
    }

    pub fn resume(&mut self) -> Result<Revision> {
        self.status = self.check(JobAction::Resume)?;
        tracing::info!("Job {} resumed", self.id);
        Ok(self.meta.touch())
    }

    /// Report item counters for a single-stage job
    pub fn update_progress(&mut self, completed: i64, total: i64) -> Result<Revision> {
        self.check(JobAction::UpdateProgress)?;
        if self.is_multi_stage() {
            return Err(JobError::invalid_input(
                "Progress of a multi-stage job is reported per stage",
            ));
        }
        let (completed, total) = validate_counts(completed, total)?;

        self.completed_items = completed;
        self.total_items = total;
        self.progress = progress_percent(completed, total);

        tracing::debug!(
            "Job {} progress {}/{} ({}%)",
            self.id,
            completed,
            total,
            self.progress
        );
        Ok(self.meta.touch())
    }

    /// Record the unit of work the worker is currently on
    pub fn set_current_item(&mut self, item: impl Into<String>) -> Result<Revision> {
        self.check(JobAction::UpdateProgress)?;
        self.current_item = Some(item.into());
        Ok(self.meta.touch())
    }

    pub fn complete(&mut self, result: Option<serde_json::Value>) -> Result<Revision> {
        self.finish_successfully(JobAction::Complete, result)
    }

    /// Successful completion where some items failed along the way
    pub fn complete_with_errors(&mut self, result: Option<serde_json::Value>) -> Result<Revision> {
        self.finish_successfully(JobAction::CompleteWithErrors, result)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<Revision> {
        let next = self.check(JobAction::Fail)?;
        let message = message.into();

        self.status = next;
        self.completed_at = Some(Utc::now());
        self.errors.push(message.clone());
        self.has_errors = true;

        tracing::error!("Job {} ({}) failed: {}", self.id, self.job_type, message);
        self.message = Some(message);
        Ok(self.meta.touch())
    }

    pub fn cancel(&mut self) -> Result<Revision> {
        let next = self.check(JobAction::Cancel)?;
        self.status = next;
        self.completed_at = Some(Utc::now());
        self.message = Some("Job cancelled".to_string());

        tracing::info!("Job {} cancelled", self.id);
        Ok(self.meta.touch())
    }

    /// Append an error annotation; allowed in every state
    pub fn add_error(&mut self, message: impl Into<String>) -> Revision {
        self.errors.push(message.into());
        self.has_errors = true;
        self.meta.touch()
    }

    /// Append a stage; allowed until the run reaches a terminal state
    pub fn add_stage(&mut self, name: &str, total_items: u64) -> Result<Revision> {
        if self.status.is_terminal() {
            return Err(JobError::transition("job", self.status, "add a stage to"));
        }

        self.stages
            .get_or_insert_with(StageTracker::new)
            .add_stage(name, total_items)?;
        self.recompute_from_stages();
        Ok(self.meta.touch())
    }

    pub fn start_stage(&mut self, name: &str) -> Result<Revision> {
        self.check(JobAction::UpdateProgress)?;
        self.stages_mut(name)?.start_stage(name)?;
        self.current_item = Some(name.to_string());

        tracing::info!("Job {} entered stage '{}'", self.id, name);
        Ok(self.meta.touch())
    }

    pub fn update_stage_progress(&mut self, name: &str, completed: i64, total: i64) -> Result<Revision> {
        self.check(JobAction::UpdateProgress)?;
        self.stages_mut(name)?
            .update_stage_progress(name, completed, total)?;
        self.recompute_from_stages();

        tracing::debug!(
            "Job {} stage '{}' at {}/{} (overall {}%)",
            self.id,
            name,
            completed,
            total,
            self.progress
        );
        Ok(self.meta.touch())
    }

    /// Complete a stage; completing the last open stage completes the run
    pub fn complete_stage(&mut self, name: &str) -> Result<Revision> {
        self.check(JobAction::UpdateProgress)?;
        let tracker = self.stages_mut(name)?;
        tracker.complete_stage(name)?;
        let all_completed = tracker.all_completed();
        self.recompute_from_stages();

        tracing::info!("Job {} finished stage '{}'", self.id, name);
        if all_completed {
            self.status = self.status.apply(JobAction::Complete)?;
            self.completed_at = Some(Utc::now());
            self.current_item = None;
            tracing::info!("Job {} ({}) completed all stages", self.id, self.job_type);
        }
        Ok(self.meta.touch())
    }

    /// Fail a stage and, with it, the whole run
    pub fn fail_stage(&mut self, name: &str, message: impl Into<String>) -> Result<Revision> {
        self.check(JobAction::Fail)?;
        let message = message.into();
        self.stages_mut(name)?.fail_stage(name, message.clone())?;
        self.recompute_from_stages();

        let summary = format!("Stage '{}' failed: {}", name, message);
        self.status = self.status.apply(JobAction::Fail)?;
        self.completed_at = Some(Utc::now());
        self.errors.push(summary.clone());
        self.has_errors = true;

        tracing::error!("Job {} ({}) failed: {}", self.id, self.job_type, summary);
        self.message = Some(summary);
        Ok(self.meta.touch())
    }

    /// Failed, below the retry limit and not expired
    pub fn can_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Failed
            && self.retry_count < self.max_retries
            && self.expires_at.map_or(true, |expires| now < expires)
    }

    /// Backoff to wait before the next attempt
    pub fn next_retry_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.delay_for(self.retry_count + 1)
    }

    /// Build the next attempt of a failed run as a fresh pending run
    pub fn retry(&self, now: DateTime<Utc>) -> Result<JobRun> {
        if !self.can_retry(now) {
            return Err(JobError::transition("job", self.status, "retry"));
        }

        let mut next = JobRun::new(self.job_type.clone(), self.parameters.clone())?;
        next.resource_id = self.resource_id;
        next.priority = self.priority;
        next.max_retries = self.max_retries;
        next.expires_at = self.expires_at;
        next.retry_count = self.retry_count + 1;

        if let Some(previous) = &self.stages {
            let mut tracker = StageTracker::with_policy(previous.policy());
            for (name, stage) in previous.stages() {
                tracker.add_stage(name, stage.total_items)?;
            }
            next.stages = Some(tracker);
            next.recompute_from_stages();
        }

        tracing::info!(
            "Job {} scheduled for retry {}/{} as {}",
            self.id,
            next.retry_count,
            self.max_retries,
            next.id
        );
        Ok(next)
    }

    fn finish_successfully(
        &mut self,
        action: JobAction,
        result: Option<serde_json::Value>,
    ) -> Result<Revision> {
        let next = self.check(action)?;
        if let Some(tracker) = &self.stages {
            if !tracker.is_empty() && !tracker.all_completed() {
                return Err(JobError::transition(
                    "job",
                    self.status,
                    format!("{} (stages still open)", action),
                ));
            }
        }

        self.status = next;
        self.completed_at = Some(Utc::now());
        self.progress = 100;
        self.result = result;
        self.current_item = None;
        if action == JobAction::CompleteWithErrors {
            self.has_errors = true;
        }

        tracing::info!(
            "Job {} ({}) completed{}",
            self.id,
            self.job_type,
            if self.has_errors { " with errors" } else { "" }
        );
        Ok(self.meta.touch())
    }

    fn check(&self, action: JobAction) -> Result<JobStatus> {
        self.status.apply(action).map_err(|e| {
            tracing::warn!("Job {} rejected transition: {}", self.id, e);
            e
        })
    }

    fn stages_mut(&mut self, name: &str) -> Result<&mut StageTracker> {
        self.stages.as_mut().ok_or_else(|| JobError::StageNotFound {
            stage: name.to_string(),
        })
    }

    fn recompute_from_stages(&mut self) {
        if let Some(tracker) = &self.stages {
            let (total, completed) = tracker.overall_items();
            self.progress = tracker.overall_progress();
            self.total_items = total;
            self.completed_items = completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn job() -> JobRun {
        JobRun::new("thumbnail", JobParameters::default()).unwrap()
    }

    fn running_job() -> JobRun {
        let mut job = job();
        job.start().unwrap();
        job
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.progress(), 0);
        assert!(job.started_at().is_none());
        assert_eq!(job.revision().version, 0);
        assert!(JobRun::new("  ", JobParameters::default()).is_err());
    }

    #[test]
    fn test_start_sets_timestamp() {
        let mut job = job();
        let revision = job.start().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.started_at().is_some());
        assert_eq!(revision.version, 1);

        let err = job.start().unwrap_err();
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn test_update_progress_validation() {
        let mut job = job();
        assert!(job.update_progress(1, 10).unwrap_err().is_invalid_transition());

        job.start().unwrap();
        assert!(matches!(
            job.update_progress(-1, 10),
            Err(JobError::InvalidInput { .. })
        ));
        assert!(matches!(
            job.update_progress(11, 10),
            Err(JobError::InvalidInput { .. })
        ));

        job.update_progress(1, 3).unwrap();
        assert_eq!(job.progress(), 33);
        job.update_progress(0, 0).unwrap();
        assert_eq!(job.progress(), 0);
    }

    #[test]
    fn test_pause_and_resume() {
        let mut job = running_job();
        job.pause().unwrap();
        assert!(job.update_progress(1, 2).is_err());
        job.resume().unwrap();
        job.update_progress(1, 2).unwrap();
        assert_eq!(job.progress(), 50);
    }

    #[test]
    fn test_terminal_state_is_frozen() {
        let mut job = running_job();
        job.update_progress(4, 8).unwrap();
        job.complete(Some(serde_json::json!({"generated": 8}))).unwrap();
        let frozen = job.clone();

        assert!(job.start().is_err());
        assert!(job.pause().is_err());
        assert!(job.update_progress(5, 8).is_err());
        assert!(job.fail("late failure").is_err());
        assert!(job.cancel().is_err());
        assert!(job.complete(None).is_err());
        assert!(job.add_stage("scan", 3).is_err());
        assert_eq!(job, frozen);
    }

    #[test]
    fn test_error_annotations_after_terminal() {
        let mut job = running_job();
        job.complete(None).unwrap();
        let before = job.revision().version;

        let revision = job.add_error("cleanup warning");
        assert_eq!(revision.version, before + 1);
        assert_eq!(job.errors(), &["cleanup warning".to_string()]);
        assert!(job.has_errors());
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_complete_with_errors_is_degraded_success() {
        let mut job = running_job();
        job.complete_with_errors(None).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.has_errors());
        assert_eq!(job.progress(), 100);
    }

    #[test]
    fn test_fail_records_message() {
        let mut job = running_job();
        job.fail("decoder crashed").unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.message(), Some("decoder crashed"));
        assert_eq!(job.errors().len(), 1);
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn test_cancel_from_pending_and_running() {
        let mut pending = job();
        pending.cancel().unwrap();
        assert_eq!(pending.status(), JobStatus::Cancelled);
        assert!(pending.started_at().is_none());

        let mut running = running_job();
        running.cancel().unwrap();
        assert_eq!(running.status(), JobStatus::Cancelled);
        assert!(running.update_progress(1, 1).unwrap_err().is_invalid_transition());
    }

    #[test]
    fn test_multi_stage_aggregation() {
        let mut job = job();
        job.add_stage("scan", 39).unwrap();
        job.add_stage("thumbnail", 39).unwrap();
        job.add_stage("cache", 39).unwrap();
        job.start().unwrap();

        job.start_stage("scan").unwrap();
        job.update_stage_progress("scan", 39, 39).unwrap();
        job.complete_stage("scan").unwrap();
        job.start_stage("thumbnail").unwrap();
        job.update_stage_progress("thumbnail", 20, 39).unwrap();

        assert_eq!(job.progress(), 50);
        assert_eq!(job.total_items(), 39);
        assert_eq!(job.completed_items(), 39);
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.update_progress(1, 2).is_err());
    }

    #[test]
    fn test_last_stage_completes_job() {
        let mut job = job();
        job.add_stage("scan", 2).unwrap();
        job.add_stage("cache", 2).unwrap();
        job.start().unwrap();

        assert!(job.complete(None).is_err());

        job.start_stage("scan").unwrap();
        job.complete_stage("scan").unwrap();
        job.start_stage("cache").unwrap();
        job.complete_stage("cache").unwrap();

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn test_fail_stage_fails_job() {
        let mut job = job();
        job.add_stage("scan", 5).unwrap();
        job.add_stage("cache", 5).unwrap();
        job.start().unwrap();
        job.start_stage("scan").unwrap();

        job.fail_stage("scan", "unreadable directory").unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.message(), Some("Stage 'scan' failed: unreadable directory"));
        assert!(job.start_stage("cache").is_err());
    }

    #[test]
    fn test_unknown_stage_leaves_job_untouched() {
        let mut job = running_job();
        let before = job.clone();
        assert!(matches!(
            job.start_stage("scan"),
            Err(JobError::StageNotFound { .. })
        ));
        assert_eq!(job, before);
    }

    #[test]
    fn test_retry_rules() {
        let now = Utc::now();
        let mut job = job().with_retry_limit(2).with_expiry(now + ChronoDuration::hours(1));
        job.add_stage("scan", 4).unwrap();
        job.start().unwrap();
        assert!(!job.can_retry(now));
        job.fail_stage("scan", "boom").unwrap();
        assert!(job.can_retry(now));
        assert!(!job.can_retry(now + ChronoDuration::hours(2)));

        let second = job.retry(now).unwrap();
        assert_ne!(second.id(), job.id());
        assert_eq!(second.status(), JobStatus::Pending);
        assert_eq!(second.retry_count(), 1);
        assert_eq!(second.stages().unwrap().len(), 1);
        assert_eq!(second.next_retry_delay(&RetryPolicy::default()), Duration::from_secs(2));

        let mut second = second;
        second.start().unwrap();
        second.fail("boom again").unwrap();
        let third = second.retry(now).unwrap();
        assert_eq!(third.retry_count(), 2);

        let mut third = third;
        third.start().unwrap();
        third.fail("still failing").unwrap();
        assert!(!third.can_retry(now));
        assert!(third.retry(now).unwrap_err().is_invalid_transition());
    }

    #[test]
    fn test_serialization_keeps_record_fields() {
        let mut job = running_job().with_resource(Uuid::new_v4());
        job.update_progress(2, 4).unwrap();

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "Running");
        assert_eq!(json["progress"], 50);
        assert!(json.get("created_at").is_some());
        assert!(json.get("version").is_some());

        let restored: JobRun = serde_json::from_value(json).unwrap();
        assert_eq!(restored, job);
    }

    proptest! {
        #[test]
        fn prop_progress_is_floor_of_ratio(total in 0i64..100_000, seed in 0i64..100_000) {
            let completed = if total == 0 { 0 } else { seed % (total + 1) };
            let mut job = running_job();
            job.update_progress(completed, total).unwrap();

            let expected = if total == 0 { 0 } else { completed * 100 / total };
            prop_assert_eq!(i64::from(job.progress()), expected);
        }
    }
}
