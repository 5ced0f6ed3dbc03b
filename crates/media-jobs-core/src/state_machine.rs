//! Lifecycle state machines for jobs and schedule runs
//!
//! Every status change in the crate goes through [`JobStatus::apply`] or
//! [`RunStatus::apply`], so the set of legal transitions lives in exactly one
//! table per entity.

use crate::error::{JobError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle actions a caller can request on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Start,
    Pause,
    Resume,
    UpdateProgress,
    Complete,
    CompleteWithErrors,
    Fail,
    Cancel,
}

impl JobStatus {
    /// Apply an action and return the resulting status.
    ///
    /// `UpdateProgress` is a guard-only action: it is legal while running and
    /// leaves the status unchanged.
    pub fn apply(self, action: JobAction) -> Result<JobStatus> {
        use JobAction as A;
        use JobStatus as S;

        let next = match (self, action) {
            (S::Pending, A::Start) => S::Running,
            (S::Running, A::Pause) => S::Paused,
            (S::Paused, A::Resume) => S::Running,
            (S::Running, A::UpdateProgress) => S::Running,
            (S::Running, A::Complete) | (S::Running, A::CompleteWithErrors) => S::Completed,
            (S::Running, A::Fail) => S::Failed,
            (S::Pending | S::Running | S::Paused, A::Cancel) => S::Cancelled,
            (from, action) => return Err(JobError::transition("job", from, action)),
        };

        Ok(next)
    }

    /// Check whether an action is permitted without applying it
    pub fn permits(self, action: JobAction) -> bool {
        self.apply(action).is_ok()
    }

    /// Completed, Failed and Cancelled are final
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Pending, Running and Paused jobs still have work ahead of them
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            _ => Err(JobError::invalid_input(format!("Invalid job status: {}", s))),
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobAction::Start => "start",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::UpdateProgress => "update progress of",
            JobAction::Complete => "complete",
            JobAction::CompleteWithErrors => "complete with errors",
            JobAction::Fail => "fail",
            JobAction::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// Status of a single schedule run record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl RunStatus {
    /// Move a running record to `target`; terminal records never move again
    pub fn apply(self, target: RunStatus) -> Result<RunStatus> {
        match (self, target) {
            (RunStatus::Running, RunStatus::Completed)
            | (RunStatus::Running, RunStatus::Failed)
            | (RunStatus::Running, RunStatus::Timeout) => Ok(target),
            (from, to) => Err(JobError::transition("run", from, format!("mark {}", to))),
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Timeout => write!(f, "timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ACTIONS: [JobAction; 8] = [
        JobAction::Start,
        JobAction::Pause,
        JobAction::Resume,
        JobAction::UpdateProgress,
        JobAction::Complete,
        JobAction::CompleteWithErrors,
        JobAction::Fail,
        JobAction::Cancel,
    ];

    #[test]
    fn test_happy_path() {
        let status = JobStatus::Pending.apply(JobAction::Start).unwrap();
        assert_eq!(status, JobStatus::Running);
        let status = status.apply(JobAction::Pause).unwrap();
        assert_eq!(status, JobStatus::Paused);
        let status = status.apply(JobAction::Resume).unwrap();
        assert_eq!(status.apply(JobAction::Complete).unwrap(), JobStatus::Completed);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for action in ALL_ACTIONS {
                let err = terminal.apply(action).unwrap_err();
                assert!(err.is_invalid_transition(), "{terminal} accepted {action}");
            }
        }
    }

    #[test]
    fn test_cancel_allowed_before_terminal() {
        assert!(JobStatus::Pending.permits(JobAction::Cancel));
        assert!(JobStatus::Running.permits(JobAction::Cancel));
        assert!(JobStatus::Paused.permits(JobAction::Cancel));
    }

    #[test]
    fn test_start_only_from_pending() {
        assert!(JobStatus::Running.apply(JobAction::Start).is_err());
        assert!(JobStatus::Paused.apply(JobAction::Start).is_err());
        assert!(JobStatus::Pending.apply(JobAction::Complete).is_err());
        assert!(JobStatus::Paused.apply(JobAction::UpdateProgress).is_err());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert_eq!("canceled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert!("bogus".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_run_status_transitions() {
        assert_eq!(
            RunStatus::Running.apply(RunStatus::Timeout).unwrap(),
            RunStatus::Timeout
        );
        assert!(RunStatus::Completed.apply(RunStatus::Failed).is_err());
        assert!(RunStatus::Timeout.apply(RunStatus::Completed).is_err());
        assert!(RunStatus::Running.apply(RunStatus::Running).is_err());
    }
}
