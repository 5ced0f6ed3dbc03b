//! Scheduled job definitions and their run statistics

use crate::error::{JobError, Result};
use crate::models::{JobId, JobParameters, JobPriority, RecordMeta, Revision};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

const DEFAULT_TIMEOUT_MINUTES: u32 = 60;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// Status tokens counted as a successful run
const SUCCESS_TOKENS: &[&str] = &[
    "completed",
    "success",
    "succeeded",
    "completedwitherrors",
    "completed_with_errors",
];

/// Kind of schedule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScheduleType {
    Cron,
    Interval,
    OneTime,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleType::Cron => write!(f, "cron"),
            ScheduleType::Interval => write!(f, "interval"),
            ScheduleType::OneTime => write!(f, "one_time"),
        }
    }
}

/// When a schedule fires; the next fire time itself is computed elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScheduleSpecDocument", into = "ScheduleSpecDocument")]
pub enum ScheduleSpec {
    Cron { expression: String },
    Interval { minutes: u32 },
    OneTime { run_at: Option<DateTime<Utc>> },
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        let expression = expression.into().trim().to_string();
        validate_cron(&expression)?;
        Ok(ScheduleSpec::Cron { expression })
    }

    pub fn interval(minutes: i64) -> Result<Self> {
        if minutes <= 0 {
            return Err(JobError::config(format!(
                "Interval schedules require a positive interval, got {} minutes",
                minutes
            )));
        }
        let minutes = u32::try_from(minutes).map_err(|_| {
            JobError::config(format!("Interval of {} minutes is too large", minutes))
        })?;
        Ok(ScheduleSpec::Interval { minutes })
    }

    pub fn one_time(run_at: Option<DateTime<Utc>>) -> Self {
        ScheduleSpec::OneTime { run_at }
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleSpec::Cron { .. } => ScheduleType::Cron,
            ScheduleSpec::Interval { .. } => ScheduleType::Interval,
            ScheduleSpec::OneTime { .. } => ScheduleType::OneTime,
        }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            ScheduleSpec::Cron { expression } => Some(expression),
            _ => None,
        }
    }

    pub fn interval_minutes(&self) -> Option<u32> {
        match self {
            ScheduleSpec::Interval { minutes } => Some(*minutes),
            _ => None,
        }
    }
}

fn cron_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(@(yearly|annually|monthly|weekly|daily|midnight|hourly)|[0-9A-Za-z*?/,#\-]+(\s+[0-9A-Za-z*?/,#\-]+){4,6})$",
            )
            .ok()
        })
        .as_ref()
}

/// Shape check only: 5 to 7 fields of cron characters, or an `@` macro
fn validate_cron(expression: &str) -> Result<()> {
    if expression.is_empty() {
        return Err(JobError::config(
            "Cron schedules require a non-empty cron expression",
        ));
    }
    let pattern =
        cron_pattern().ok_or_else(|| JobError::config("Cron pattern failed to compile"))?;
    if !pattern.is_match(expression) {
        return Err(JobError::config(format!(
            "Malformed cron expression: '{}'",
            expression
        )));
    }
    Ok(())
}

/// Flat persisted form of a schedule spec
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScheduleSpecDocument {
    schedule_type: ScheduleType,
    #[serde(default)]
    cron_expression: Option<String>,
    #[serde(default)]
    interval_minutes: Option<i64>,
    #[serde(default)]
    run_at: Option<DateTime<Utc>>,
}

impl TryFrom<ScheduleSpecDocument> for ScheduleSpec {
    type Error = JobError;

    fn try_from(doc: ScheduleSpecDocument) -> Result<Self> {
        match doc.schedule_type {
            ScheduleType::Cron => ScheduleSpec::cron(doc.cron_expression.unwrap_or_default()),
            ScheduleType::Interval => ScheduleSpec::interval(doc.interval_minutes.unwrap_or(0)),
            ScheduleType::OneTime => Ok(ScheduleSpec::one_time(doc.run_at)),
        }
    }
}

impl From<ScheduleSpec> for ScheduleSpecDocument {
    fn from(spec: ScheduleSpec) -> Self {
        let schedule_type = spec.schedule_type();
        match spec {
            ScheduleSpec::Cron { expression } => ScheduleSpecDocument {
                schedule_type,
                cron_expression: Some(expression),
                interval_minutes: None,
                run_at: None,
            },
            ScheduleSpec::Interval { minutes } => ScheduleSpecDocument {
                schedule_type,
                cron_expression: None,
                interval_minutes: Some(i64::from(minutes)),
                run_at: None,
            },
            ScheduleSpec::OneTime { run_at } => ScheduleSpecDocument {
                schedule_type,
                cron_expression: None,
                interval_minutes: None,
                run_at,
            },
        }
    }
}

/// A named recurring or one-shot job template with run statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleDefinition {
    id: JobId,
    name: String,
    description: Option<String>,
    job_type: String,
    #[serde(flatten)]
    spec: ScheduleSpec,
    is_enabled: bool,
    priority: JobPriority,
    timeout_minutes: u32,
    max_retry_attempts: u32,
    parameters: JobParameters,
    run_count: u64,
    success_count: u64,
    failure_count: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_run_duration_ms: Option<i64>,
    last_run_status: Option<String>,
    last_error_message: Option<String>,
    next_run_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    meta: RecordMeta,
}

impl ScheduleDefinition {
    /// Create a disabled schedule
    pub fn new(name: impl Into<String>, job_type: impl Into<String>, spec: ScheduleSpec) -> Result<Self> {
        let name = name.into();
        let job_type = job_type.into();
        if name.trim().is_empty() {
            return Err(JobError::config("Schedule name must not be empty"));
        }
        if job_type.trim().is_empty() {
            return Err(JobError::config("Schedule job type must not be empty"));
        }

        let next_run_at = match &spec {
            ScheduleSpec::OneTime { run_at } => *run_at,
            _ => None,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            name,
            description: None,
            job_type,
            spec,
            is_enabled: false,
            priority: JobPriority::default(),
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            parameters: JobParameters::default(),
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            last_run_at: None,
            last_run_duration_ms: None,
            last_run_status: None,
            last_error_message: None,
            next_run_at,
            meta: RecordMeta::new(),
        })
    }

    pub fn cron(
        name: impl Into<String>,
        job_type: impl Into<String>,
        expression: impl Into<String>,
    ) -> Result<Self> {
        Self::new(name, job_type, ScheduleSpec::cron(expression)?)
    }

    pub fn interval(name: impl Into<String>, job_type: impl Into<String>, minutes: i64) -> Result<Self> {
        Self::new(name, job_type, ScheduleSpec::interval(minutes)?)
    }

    pub fn one_time(
        name: impl Into<String>,
        job_type: impl Into<String>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        Self::new(name, job_type, ScheduleSpec::one_time(run_at))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn spec(&self) -> &ScheduleSpec {
        &self.spec
    }

    pub fn schedule_type(&self) -> ScheduleType {
        self.spec.schedule_type()
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn timeout_minutes(&self) -> u32 {
        self.timeout_minutes
    }

    pub fn timeout(&self) -> Duration {
        Duration::minutes(i64::from(self.timeout_minutes))
    }

    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    pub fn parameters(&self) -> &JobParameters {
        &self.parameters
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at
    }

    pub fn last_run_duration(&self) -> Option<Duration> {
        self.last_run_duration_ms.map(Duration::milliseconds)
    }

    pub fn last_run_status(&self) -> Option<&str> {
        self.last_run_status.as_deref()
    }

    pub fn last_error_message(&self) -> Option<&str> {
        self.last_error_message.as_deref()
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.next_run_at
    }

    pub fn revision(&self) -> Revision {
        self.meta.revision()
    }

    /// Returns `true` if the schedule was disabled before
    pub fn enable(&mut self) -> bool {
        if self.is_enabled {
            return false;
        }
        self.is_enabled = true;
        self.meta.touch();
        tracing::info!("Schedule '{}' enabled", self.name);
        true
    }

    /// Returns `true` if the schedule was enabled before
    pub fn disable(&mut self) -> bool {
        if !self.is_enabled {
            return false;
        }
        self.is_enabled = false;
        self.meta.touch();
        tracing::info!("Schedule '{}' disabled", self.name);
        true
    }

    pub fn set_description(&mut self, description: impl Into<String>) -> Revision {
        self.description = Some(description.into());
        self.meta.touch()
    }

    pub fn set_priority(&mut self, priority: u8) -> Result<Revision> {
        self.priority = JobPriority::new(priority)?;
        Ok(self.meta.touch())
    }

    pub fn set_timeout_minutes(&mut self, minutes: u32) -> Result<Revision> {
        if minutes == 0 {
            return Err(JobError::config("Timeout must be at least one minute"));
        }
        self.timeout_minutes = minutes;
        Ok(self.meta.touch())
    }

    pub fn set_max_retry_attempts(&mut self, attempts: u32) -> Revision {
        self.max_retry_attempts = attempts;
        self.meta.touch()
    }

    pub fn set_parameters(&mut self, parameters: JobParameters) -> Revision {
        self.parameters = parameters;
        self.meta.touch()
    }

    /// Fold one finished execution into the run statistics
    pub fn record_job_run(
        &mut self,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        status: &str,
        error: Option<&str>,
    ) -> Result<Revision> {
        if ended_at < started_at {
            return Err(JobError::invalid_input(format!(
                "Run of schedule '{}' ends before it starts",
                self.name
            )));
        }

        let succeeded = is_success_token(status);
        self.run_count += 1;
        if succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.last_run_at = Some(started_at);
        self.last_run_duration_ms = Some((ended_at - started_at).num_milliseconds());
        self.last_run_status = Some(status.to_string());
        self.last_error_message = error.map(str::to_string);

        if self.schedule_type() == ScheduleType::OneTime {
            self.is_enabled = false;
            self.next_run_at = None;
        }

        tracing::info!(
            "Schedule '{}' recorded run #{} with status {} ({} ok / {} failed)",
            self.name,
            self.run_count,
            status,
            self.success_count,
            self.failure_count
        );
        Ok(self.meta.touch())
    }

    /// Store the next fire time computed by the scheduler
    pub fn update_next_run_time(&mut self, next_run_at: DateTime<Utc>) -> Revision {
        self.next_run_at = Some(next_run_at);
        tracing::debug!("Schedule '{}' next run at {}", self.name, next_run_at);
        self.meta.touch()
    }

    pub fn clear_next_run_time(&mut self) -> Revision {
        self.next_run_at = None;
        self.meta.touch()
    }

    /// Enabled and its next fire time has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Percentage of recorded runs that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.run_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.run_count as f64 * 100.0
    }
}

fn is_success_token(status: &str) -> bool {
    let normalized = status.trim().to_lowercase();
    SUCCESS_TOKENS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_validation() {
        let err = ScheduleDefinition::cron("nightly", "cache", "").unwrap_err();
        assert!(matches!(err, JobError::ConfigError { .. }));

        let err = ScheduleDefinition::interval("sweep", "cleanup", 0).unwrap_err();
        assert!(matches!(err, JobError::ConfigError { .. }));
        assert!(ScheduleDefinition::interval("sweep", "cleanup", -5).is_err());

        assert!(ScheduleDefinition::cron("nightly", "cache", "not a cron").is_err());
        assert!(ScheduleDefinition::cron("", "cache", "0 3 * * *").is_err());
    }

    #[test]
    fn test_valid_schedules_start_disabled() {
        let cron = ScheduleDefinition::cron("nightly", "cache", "0 3 * * *").unwrap();
        assert!(!cron.is_enabled());
        assert_eq!(cron.schedule_type(), ScheduleType::Cron);
        assert_eq!(cron.spec().cron_expression(), Some("0 3 * * *"));
        assert_eq!(cron.spec().interval_minutes(), None);

        let interval = ScheduleDefinition::interval("sweep", "cleanup", 15).unwrap();
        assert_eq!(interval.spec().interval_minutes(), Some(15));
        assert!(ScheduleDefinition::cron("weekly", "digest", "@weekly").is_ok());
        assert!(ScheduleDefinition::cron("sec", "digest", "*/10 * * * * ?").is_ok());
    }

    #[test]
    fn test_enable_disable_idempotent() {
        let mut schedule = ScheduleDefinition::interval("sweep", "cleanup", 5).unwrap();
        assert!(schedule.enable());
        let revision = schedule.revision();
        assert!(!schedule.enable());
        assert_eq!(schedule.revision(), revision);
        assert!(schedule.disable());
        assert!(!schedule.disable());
        assert!(!schedule.is_enabled());
    }

    #[test]
    fn test_record_job_run_counters() {
        let mut schedule = ScheduleDefinition::interval("sweep", "cleanup", 5).unwrap();
        let start = Utc::now();
        let end = start + Duration::seconds(3);

        schedule.record_job_run(start, end, "Completed", None).unwrap();
        schedule
            .record_job_run(start, end, "Failed", Some("disk full"))
            .unwrap();
        schedule.record_job_run(start, end, "Completed", None).unwrap();

        assert_eq!(schedule.run_count(), 3);
        assert_eq!(schedule.success_count(), 2);
        assert_eq!(schedule.failure_count(), 1);
        assert_eq!(schedule.last_run_status(), Some("Completed"));
        assert_eq!(schedule.last_error_message(), None);
        assert_eq!(schedule.last_run_duration(), Some(Duration::seconds(3)));
        assert!((schedule.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_record_job_run_rejects_inverted_times() {
        let mut schedule = ScheduleDefinition::interval("sweep", "cleanup", 5).unwrap();
        let start = Utc::now();
        assert!(schedule
            .record_job_run(start, start - Duration::seconds(1), "Completed", None)
            .is_err());
        assert_eq!(schedule.run_count(), 0);
    }

    #[test]
    fn test_one_time_schedule_disables_after_run() {
        let at = Utc::now();
        let mut schedule = ScheduleDefinition::one_time("reindex", "scan", Some(at)).unwrap();
        assert_eq!(schedule.next_run_at(), Some(at));
        schedule.enable();
        assert!(schedule.is_due(at));

        schedule.record_job_run(at, at, "Timeout", None).unwrap();
        assert_eq!(schedule.failure_count(), 1);
        assert!(!schedule.is_enabled());
        assert!(schedule.next_run_at().is_none());
    }

    #[test]
    fn test_priority_validation() {
        let mut schedule = ScheduleDefinition::interval("sweep", "cleanup", 5).unwrap();
        assert!(matches!(
            schedule.set_priority(11),
            Err(JobError::ConfigError { .. })
        ));
        schedule.set_priority(9).unwrap();
        assert_eq!(schedule.priority().value(), 9);
        assert!(schedule.set_timeout_minutes(0).is_err());
    }

    #[test]
    fn test_flat_document_form() {
        let mut schedule = ScheduleDefinition::cron("nightly", "cache", "0 3 * * *").unwrap();
        schedule.update_next_run_time(Utc::now());

        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["schedule_type"], "Cron");
        assert_eq!(json["cron_expression"], "0 3 * * *");
        assert!(json["interval_minutes"].is_null());

        let restored: ScheduleDefinition = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(restored, schedule);

        let mut broken = json;
        broken["cron_expression"] = serde_json::Value::Null;
        assert!(serde_json::from_value::<ScheduleDefinition>(broken).is_err());
    }
}
