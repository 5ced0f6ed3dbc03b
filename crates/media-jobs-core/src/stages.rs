//! Multi-stage progress tracking
//!
//! A multi-stage job runs the same logical item set through several ordered
//! phases (for example `scan`, `thumbnail`, `cache`). Overall progress is the
//! rounded mean of the per-stage percentages, while the overall item counts are
//! taken from the first stage so items are not counted once per phase.

use crate::error::{JobError, Result};
use crate::models::{progress_percent, validate_counts};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of an individual stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How stage totals are checked against each other
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StageTotalsPolicy {
    /// Stages may report different totals; the first stage's totals win
    #[default]
    Lenient,
    /// Every stage must report the same total as the first stage
    Strict,
}

/// Progress record for one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub status: StageStatus,
    pub total_items: u64,
    pub completed_items: u64,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    fn new(total_items: u64) -> Self {
        Self {
            status: StageStatus::Pending,
            total_items,
            completed_items: 0,
            message: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Stage percentage, truncated
    pub fn progress(&self) -> u8 {
        if self.status == StageStatus::Completed {
            return 100;
        }
        progress_percent(self.completed_items, self.total_items)
    }
}

/// Ordered collection of named stages
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageTracker {
    stages: IndexMap<String, Stage>,
    #[serde(default)]
    policy: StageTotalsPolicy,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: StageTotalsPolicy) -> Self {
        Self {
            stages: IndexMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> StageTotalsPolicy {
        self.policy
    }

    /// Append a stage; insertion order is execution order
    pub fn add_stage(&mut self, name: &str, total_items: u64) -> Result<()> {
        if name.trim().is_empty() {
            return Err(JobError::config("Stage name must not be empty"));
        }
        if self.stages.contains_key(name) {
            return Err(JobError::config(format!("Stage '{}' already exists", name)));
        }
        self.check_total(name, total_items)?;

        self.stages.insert(name.to_string(), Stage::new(total_items));
        Ok(())
    }

    pub fn start_stage(&mut self, name: &str) -> Result<()> {
        let stage = self.stage_mut(name)?;
        if stage.status != StageStatus::Pending {
            return Err(JobError::transition("stage", stage.status, "start"));
        }

        stage.status = StageStatus::Running;
        stage.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn update_stage_progress(&mut self, name: &str, completed: i64, total: i64) -> Result<()> {
        let (completed, total) = validate_counts(completed, total)?;
        self.check_total(name, total)?;

        let stage = self.stage_mut(name)?;
        if stage.status != StageStatus::Running {
            return Err(JobError::transition(
                "stage",
                stage.status,
                "update progress of",
            ));
        }

        stage.completed_items = completed;
        stage.total_items = total;
        Ok(())
    }

    pub fn set_stage_message(&mut self, name: &str, message: impl Into<String>) -> Result<()> {
        let stage = self.stage_mut(name)?;
        stage.message = Some(message.into());
        Ok(())
    }

    /// Mark a stage done; its completed count is raised to its total
    pub fn complete_stage(&mut self, name: &str) -> Result<()> {
        let stage = self.stage_mut(name)?;
        match stage.status {
            StageStatus::Pending | StageStatus::Running => {}
            other => return Err(JobError::transition("stage", other, "complete")),
        }

        let now = Utc::now();
        stage.status = StageStatus::Completed;
        stage.completed_items = stage.total_items;
        stage.started_at.get_or_insert(now);
        stage.completed_at = Some(now);
        Ok(())
    }

    pub fn fail_stage(&mut self, name: &str, message: impl Into<String>) -> Result<()> {
        let stage = self.stage_mut(name)?;
        match stage.status {
            StageStatus::Pending | StageStatus::Running => {}
            other => return Err(JobError::transition("stage", other, "fail")),
        }

        stage.status = StageStatus::Failed;
        stage.message = Some(message.into());
        stage.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.get(name)
    }

    pub fn stages(&self) -> impl Iterator<Item = (&str, &Stage)> {
        self.stages.iter().map(|(name, stage)| (name.as_str(), stage))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Rounded mean of the per-stage percentages
    pub fn overall_progress(&self) -> u8 {
        if self.stages.is_empty() {
            return 0;
        }
        let sum: u32 = self.stages.values().map(|s| u32::from(s.progress())).sum();
        let mean = f64::from(sum) / self.stages.len() as f64;
        mean.round() as u8
    }

    /// `(total, completed)` of the first stage
    pub fn overall_items(&self) -> (u64, u64) {
        self.stages
            .values()
            .next()
            .map(|s| (s.total_items, s.completed_items))
            .unwrap_or((0, 0))
    }

    pub fn all_completed(&self) -> bool {
        !self.stages.is_empty()
            && self
                .stages
                .values()
                .all(|s| s.status == StageStatus::Completed)
    }

    pub fn any_failed(&self) -> bool {
        self.stages.values().any(|s| s.status == StageStatus::Failed)
    }

    /// First stage that has not finished yet
    pub fn current_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|(_, s)| matches!(s.status, StageStatus::Pending | StageStatus::Running))
            .map(|(name, _)| name.as_str())
    }

    fn stage_mut(&mut self, name: &str) -> Result<&mut Stage> {
        self.stages
            .get_mut(name)
            .ok_or_else(|| JobError::StageNotFound {
                stage: name.to_string(),
            })
    }

    fn check_total(&self, name: &str, total: u64) -> Result<()> {
        if self.policy == StageTotalsPolicy::Lenient {
            return Ok(());
        }
        match self.stages.first() {
            Some((first_name, first)) if first_name != name && first.total_items != total => {
                Err(JobError::config(format!(
                    "Stage '{}' total {} differs from first stage '{}' total {}",
                    name, total, first_name, first.total_items
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_stage_tracker() -> StageTracker {
        let mut tracker = StageTracker::new();
        tracker.add_stage("scan", 39).unwrap();
        tracker.add_stage("thumbnail", 39).unwrap();
        tracker.add_stage("cache", 39).unwrap();
        tracker
    }

    #[test]
    fn test_aggregation_uses_first_stage_totals() {
        let mut tracker = three_stage_tracker();
        tracker.start_stage("scan").unwrap();
        tracker.update_stage_progress("scan", 39, 39).unwrap();
        tracker.complete_stage("scan").unwrap();
        tracker.start_stage("thumbnail").unwrap();
        tracker.update_stage_progress("thumbnail", 20, 39).unwrap();

        assert_eq!(tracker.stage("thumbnail").unwrap().progress(), 51);
        assert_eq!(tracker.overall_progress(), 50);
        assert_eq!(tracker.overall_items(), (39, 39));
        assert_eq!(tracker.current_stage(), Some("thumbnail"));
    }

    #[test]
    fn test_stage_order_is_preserved() {
        let tracker = three_stage_tracker();
        let names: Vec<_> = tracker.stages().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["scan", "thumbnail", "cache"]);
    }

    #[test]
    fn test_duplicate_and_unknown_stages() {
        let mut tracker = three_stage_tracker();
        assert!(matches!(
            tracker.add_stage("scan", 10),
            Err(JobError::ConfigError { .. })
        ));
        assert!(matches!(
            tracker.start_stage("upload"),
            Err(JobError::StageNotFound { .. })
        ));
    }

    #[test]
    fn test_update_requires_running_stage() {
        let mut tracker = three_stage_tracker();
        let err = tracker.update_stage_progress("cache", 1, 39).unwrap_err();
        assert!(err.is_invalid_transition());

        tracker.start_stage("cache").unwrap();
        assert!(tracker.update_stage_progress("cache", 40, 39).is_err());
        assert!(tracker.update_stage_progress("cache", -1, 39).is_err());
    }

    #[test]
    fn test_completion_and_failure_flags() {
        let mut tracker = StageTracker::new();
        tracker.add_stage("scan", 2).unwrap();
        tracker.add_stage("cache", 2).unwrap();
        tracker.complete_stage("scan").unwrap();
        assert!(!tracker.all_completed());

        tracker.fail_stage("cache", "disk full").unwrap();
        assert!(tracker.any_failed());
        assert!(tracker.complete_stage("cache").is_err());
        assert_eq!(
            tracker.stage("cache").unwrap().message.as_deref(),
            Some("disk full")
        );
    }

    #[test]
    fn test_strict_policy_rejects_mismatched_totals() {
        let mut tracker = StageTracker::with_policy(StageTotalsPolicy::Strict);
        tracker.add_stage("scan", 39).unwrap();
        assert!(tracker.add_stage("thumbnail", 40).is_err());
        tracker.add_stage("thumbnail", 39).unwrap();

        tracker.start_stage("thumbnail").unwrap();
        assert!(tracker.update_stage_progress("thumbnail", 5, 12).is_err());
        tracker.update_stage_progress("thumbnail", 5, 39).unwrap();
    }

    #[test]
    fn test_empty_tracker() {
        let tracker = StageTracker::new();
        assert_eq!(tracker.overall_progress(), 0);
        assert_eq!(tracker.overall_items(), (0, 0));
        assert!(!tracker.all_completed());
    }
}
