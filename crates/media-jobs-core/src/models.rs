//! Shared value types for job tracking

use crate::error::{JobError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for jobs, schedules and run records
pub type JobId = Uuid;

/// Job priority, 1 (lowest) to 10 (highest)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub struct JobPriority(u8);

impl JobPriority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(JobError::config(format!(
                "Priority must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority(5)
    }
}

impl TryFrom<u8> for JobPriority {
    type Error = JobError;

    fn try_from(value: u8) -> Result<Self> {
        JobPriority::new(value)
    }
}

impl From<JobPriority> for u8 {
    fn from(priority: JobPriority) -> u8 {
        priority.0
    }
}

/// What caused a run to start
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TriggerSource {
    #[default]
    Scheduler,
    Manual,
    Api,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Scheduler => write!(f, "scheduler"),
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Api => write!(f, "api"),
        }
    }
}

/// Known item-level failure categories
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    DecodeError,
    Timeout,
    IoError,
    UnsupportedFormat,
    NotFound,
    Corrupted,
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::DecodeError => write!(f, "DecodeError"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::IoError => write!(f, "IoError"),
            ErrorKind::UnsupportedFormat => write!(f, "UnsupportedFormat"),
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::Corrupted => write!(f, "Corrupted"),
            ErrorKind::Other(name) => f.write_str(name),
        }
    }
}

impl ErrorKind {
    /// Build a kind from a free-form name, mapping known names to their variant
    pub fn other(name: impl Into<String>) -> Self {
        let name: String = name.into();
        ErrorKind::from(name)
    }

    /// Canonical form, so an `Other` spelling a known kind counts as that kind
    pub fn normalized(self) -> Self {
        match self {
            ErrorKind::Other(name) => ErrorKind::from(name),
            known => known,
        }
    }
}

impl FromStr for ErrorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().as_str() {
            "decodeerror" | "decode_error" | "decode" => ErrorKind::DecodeError,
            "timeout" => ErrorKind::Timeout,
            "ioerror" | "io_error" | "io" => ErrorKind::IoError,
            "unsupportedformat" | "unsupported_format" => ErrorKind::UnsupportedFormat,
            "notfound" | "not_found" => ErrorKind::NotFound,
            "corrupted" | "corrupt" => ErrorKind::Corrupted,
            _ => ErrorKind::Other(s.trim().to_string()),
        };
        Ok(kind)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        ErrorKind::from(value.to_string())
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> String {
        kind.to_string()
    }
}

/// Occurrence counts per error kind
///
/// Keys are always normalized, so every kind has a single entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ErrorSummary(BTreeMap<ErrorKind, u32>);

impl ErrorSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `kind`, returning the new count
    pub fn record(&mut self, kind: ErrorKind) -> u32 {
        self.add(kind, 1)
    }

    pub fn count(&self, kind: &ErrorKind) -> u32 {
        self.0.get(&kind.clone().normalized()).copied().unwrap_or(0)
    }

    fn add(&mut self, kind: ErrorKind, amount: u32) -> u32 {
        let count = self.0.entry(kind.normalized()).or_insert(0);
        *count = count.saturating_add(amount);
        *count
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ErrorKind, &u32)> {
        self.0.iter()
    }
}

// Spellings that normalize to the same kind are summed.
impl<'de> Deserialize<'de> for ErrorSummary {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, u32>::deserialize(deserializer)?;
        let mut summary = ErrorSummary::new();
        for (name, count) in raw {
            summary.add(ErrorKind::from(name), count);
        }
        Ok(summary)
    }
}

/// Renders as `"DecodeError: 3, Timeout: 1"`, most frequent first
impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort_by(|(ka, ca), (kb, cb)| {
            cb.cmp(ca)
                .then_with(|| ka.to_string().cmp(&kb.to_string()))
        });

        for (i, (kind, count)) in entries.into_iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", kind, count)?;
        }
        Ok(())
    }
}

/// Opaque key-value blob handed through to workers untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSettings(serde_json::Value);

/// Trigger parameters share the settings representation
pub type JobParameters = JobSettings;

impl JobSettings {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl From<serde_json::Value> for JobSettings {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Version stamp produced by every successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Creation and last-write bookkeeping shared by all persisted records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl RecordMeta {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Stamp a write and hand back the new revision
    pub(crate) fn touch(&mut self) -> Revision {
        self.updated_at = Utc::now().max(self.updated_at);
        self.version += 1;
        self.revision()
    }

    pub fn revision(&self) -> Revision {
        Revision {
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Integer percentage, truncated, 0 when nothing is known yet
pub fn progress_percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (u128::from(completed) * 100) / u128::from(total);
    percent.min(100) as u8
}

/// Validate a worker-reported `(completed, total)` pair
pub(crate) fn validate_counts(completed: i64, total: i64) -> Result<(u64, u64)> {
    if completed < 0 || total < 0 {
        return Err(JobError::invalid_input(format!(
            "Progress counters must not be negative (completed={}, total={})",
            completed, total
        )));
    }
    if completed > total {
        return Err(JobError::invalid_input(format!(
            "Completed items ({}) exceed total items ({})",
            completed, total
        )));
    }
    Ok((completed as u64, total as u64))
}
