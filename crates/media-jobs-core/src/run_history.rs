//! Per-execution records of scheduled jobs

use crate::error::Result;
use crate::models::{JobId, RecordMeta, Revision, TriggerSource};
use crate::state_machine::RunStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One execution of a schedule, sealed once it reaches a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    id: Uuid,
    schedule_id: JobId,
    job_run_id: Option<JobId>,
    trigger_source: TriggerSource,
    status: RunStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    result: Option<serde_json::Value>,
    #[serde(flatten)]
    meta: RecordMeta,
}

impl RunHistory {
    pub fn open(schedule_id: JobId, trigger_source: TriggerSource) -> Self {
        Self::open_at(schedule_id, trigger_source, Utc::now())
    }

    pub fn open_at(schedule_id: JobId, trigger_source: TriggerSource, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            job_run_id: None,
            trigger_source,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            result: None,
            meta: RecordMeta::new(),
        }
    }

    pub fn with_job_run(mut self, job_run_id: JobId) -> Self {
        self.job_run_id = Some(job_run_id);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn schedule_id(&self) -> JobId {
        self.schedule_id
    }

    pub fn job_run_id(&self) -> Option<JobId> {
        self.job_run_id
    }

    pub fn trigger_source(&self) -> TriggerSource {
        self.trigger_source
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::milliseconds)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn revision(&self) -> Revision {
        self.meta.revision()
    }

    pub fn complete(&mut self, result: Option<serde_json::Value>) -> Result<Revision> {
        self.complete_at(result, Utc::now())
    }

    pub fn complete_at(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) -> Result<Revision> {
        let revision = self.seal(RunStatus::Completed, now)?;
        self.result = result;
        Ok(revision)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<Revision> {
        self.fail_at(error, Utc::now())
    }

    pub fn fail_at(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<Revision> {
        let revision = self.seal(RunStatus::Failed, now)?;
        self.error_message = Some(error.into());
        Ok(revision)
    }

    pub fn timeout(&mut self) -> Result<Revision> {
        self.timeout_at(Utc::now())
    }

    pub fn timeout_at(&mut self, now: DateTime<Utc>) -> Result<Revision> {
        let revision = self.seal(RunStatus::Timeout, now)?;
        self.error_message = Some("Job execution timed out".to_string());
        Ok(revision)
    }

    fn seal(&mut self, target: RunStatus, now: DateTime<Utc>) -> Result<Revision> {
        self.status = self.status.apply(target)?;
        // A clock stepping backwards still yields a non-negative duration.
        let completed_at = now.max(self.started_at);
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds());
        tracing::debug!(
            "Run {} of schedule {} finished as {} after {}ms",
            self.id,
            self.schedule_id,
            self.status,
            (completed_at - self.started_at).num_milliseconds()
        );
        Ok(self.meta.touch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;

    #[test]
    fn test_complete_sets_duration() {
        let start = Utc::now();
        let mut run = RunHistory::open_at(Uuid::new_v4(), TriggerSource::Scheduler, start);
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.duration().is_none());

        run.complete_at(Some(serde_json::json!({"items": 4})), start + Duration::milliseconds(150))
            .unwrap();
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.duration(), Some(Duration::milliseconds(150)));
        assert_eq!(run.result().unwrap()["items"], 4);
    }

    #[test]
    fn test_terminal_run_rejects_further_transitions() {
        let mut run = RunHistory::open(Uuid::new_v4(), TriggerSource::Manual);
        run.fail("boom").unwrap();
        let snapshot = run.clone();

        let err = run.complete(None).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert!(run.timeout().is_err());
        assert!(run.fail("again").is_err());
        assert_eq!(run, snapshot);
        assert_eq!(run.error_message(), Some("boom"));
    }

    #[test]
    fn test_timeout_records_message() {
        let start = Utc::now();
        let mut run = RunHistory::open_at(Uuid::new_v4(), TriggerSource::Api, start)
            .with_job_run(Uuid::new_v4());
        run.timeout_at(start + Duration::minutes(61)).unwrap();
        assert_eq!(run.status(), RunStatus::Timeout);
        assert!(run.is_terminal());
        assert!(run.job_run_id().is_some());
        assert_eq!(run.duration(), Some(Duration::minutes(61)));
    }
}
