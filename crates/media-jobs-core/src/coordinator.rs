//! In-process coordination between triggers, workers and the job records
//!
//! [`JobCoordinator`] is the single logical owner of every live [`JobRun`]:
//! all writes for one job go through its write lock, so concurrent worker
//! callbacks for the same job are serialised. Once a run tied to a schedule
//! reaches a terminal state, the coordinator seals the matching
//! [`RunHistory`], folds the outcome into the [`ScheduleDefinition`] and asks
//! the [`NextRunCalculator`] for the next fire time.

use crate::config::JobDefaults;
use crate::error::{JobError, Result};
use crate::job_run::JobRun;
use crate::models::{ErrorKind, JobId, JobParameters, JobPriority, Revision, TriggerSource};
use crate::persistence::JobStateStore;
use crate::resumable::ResumableProcessingState;
use crate::run_history::RunHistory;
use crate::schedule::{ScheduleDefinition, ScheduleSpec};
use crate::state_machine::{JobAction, JobStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// Status change notification for subscribers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub old_status: JobStatus,
    pub new_status: JobStatus,
    pub progress: u8,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

/// Computes when a schedule fires next
pub trait NextRunCalculator: Send + Sync + std::fmt::Debug {
    /// `None` leaves the schedule without a next fire time
    fn next_run(&self, schedule: &ScheduleDefinition, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Handles interval schedules only; cron evaluation belongs to the host scheduler
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalCalculator;

impl NextRunCalculator for IntervalCalculator {
    fn next_run(&self, schedule: &ScheduleDefinition, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match schedule.spec() {
            ScheduleSpec::Interval { minutes } => Some(after + Duration::minutes(i64::from(*minutes))),
            ScheduleSpec::Cron { .. } | ScheduleSpec::OneTime { .. } => None,
        }
    }
}

/// Bookkeeping for one live run
#[derive(Debug)]
struct TrackedJob {
    run: JobRun,
    schedule_id: Option<JobId>,
    history: Option<RunHistory>,
    processing: Option<ResumableProcessingState>,
    cancellation_token: CancellationToken,
    timeout: Option<Duration>,
    timed_out: bool,
    retried_as: Option<JobId>,
}

/// Outcome of a terminal run that must be folded into its schedule
#[derive(Debug)]
struct FinishedRun {
    schedule_id: JobId,
    history: RunHistory,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    status: &'static str,
    error: Option<String>,
}

/// Result of one locked mutation, applied after the lock is released
struct Applied<T> {
    value: T,
    event: Option<JobEvent>,
    finished: Option<FinishedRun>,
    persist: Option<ResumableProcessingState>,
}

/// Coordinates schedules, live runs and their history
#[derive(Debug)]
pub struct JobCoordinator {
    schedules: Arc<RwLock<HashMap<JobId, ScheduleDefinition>>>,
    jobs: Arc<RwLock<HashMap<JobId, TrackedJob>>>,
    history: Arc<RwLock<Vec<RunHistory>>>,
    store: Option<Arc<dyn JobStateStore>>,
    calculator: Arc<dyn NextRunCalculator>,
    status_sender: broadcast::Sender<JobEvent>,
    defaults: JobDefaults,
}

impl JobCoordinator {
    pub fn new(defaults: JobDefaults) -> Self {
        let (status_sender, _) = broadcast::channel(defaults.event_capacity.max(1));

        Self {
            schedules: Arc::new(RwLock::new(HashMap::new())),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(Vec::new())),
            store: None,
            calculator: Arc::new(IntervalCalculator),
            status_sender,
            defaults,
        }
    }

    /// Persist resumable state through `store` after every change
    pub fn with_store(mut self, store: Arc<dyn JobStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_calculator(mut self, calculator: Arc<dyn NextRunCalculator>) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Subscribe to job status updates
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.status_sender.subscribe()
    }

    // ---- schedules ----

    /// Take ownership of a schedule; enabled schedules get a first fire time
    pub async fn register_schedule(&self, mut schedule: ScheduleDefinition) -> Result<JobId> {
        let id = schedule.id();
        if schedule.is_enabled() && schedule.next_run_at().is_none() {
            if let Some(next) = self.calculator.next_run(&schedule, Utc::now()) {
                schedule.update_next_run_time(next);
            }
        }

        let mut schedules = self.schedules.write().await;
        if schedules.contains_key(&id) {
            return Err(JobError::config(format!("Schedule {} is already registered", id)));
        }
        tracing::info!(
            "Registered {} schedule '{}' for job type {}",
            schedule.schedule_type(),
            schedule.name(),
            schedule.job_type()
        );
        schedules.insert(id, schedule);
        Ok(id)
    }

    pub async fn schedule(&self, schedule_id: JobId) -> Option<ScheduleDefinition> {
        self.schedules.read().await.get(&schedule_id).cloned()
    }

    pub async fn schedules(&self) -> Vec<ScheduleDefinition> {
        self.schedules.read().await.values().cloned().collect()
    }

    /// Returns whether the schedule changed
    pub async fn enable_schedule(&self, schedule_id: JobId) -> Result<bool> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| not_found(schedule_id))?;
        let changed = schedule.enable();
        if changed && schedule.next_run_at().is_none() {
            if let Some(next) = self.calculator.next_run(schedule, Utc::now()) {
                schedule.update_next_run_time(next);
            }
        }
        Ok(changed)
    }

    /// Returns whether the schedule changed
    pub async fn disable_schedule(&self, schedule_id: JobId) -> Result<bool> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| not_found(schedule_id))?;
        Ok(schedule.disable())
    }

    /// Enabled schedules whose next fire time is at or before `now`
    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let schedules = self.schedules.read().await;
        let mut due: Vec<&ScheduleDefinition> =
            schedules.values().filter(|s| s.is_due(now)).collect();
        // Highest priority first, then the longest overdue.
        due.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then(a.next_run_at().cmp(&b.next_run_at()))
        });
        due.into_iter().map(|s| s.id()).collect()
    }

    /// Create a run for an enabled schedule and open its history record
    pub async fn trigger_schedule(&self, schedule_id: JobId, source: TriggerSource) -> Result<JobId> {
        let (run, timeout) = {
            let schedules = self.schedules.read().await;
            let schedule = schedules.get(&schedule_id).ok_or_else(|| not_found(schedule_id))?;
            if !schedule.is_enabled() {
                return Err(JobError::transition("schedule", "disabled", "trigger"));
            }
            let run = JobRun::new(schedule.job_type(), schedule.parameters().clone())?
                .with_resource(schedule_id)
                .with_priority(schedule.priority())
                .with_retry_limit(schedule.max_retry_attempts())
                .with_stage_policy(self.defaults.stage_totals);
            (run, schedule.timeout())
        };

        let job_id = run.id();
        let history = RunHistory::open(schedule_id, source).with_job_run(job_id);
        tracing::info!(
            "Schedule {} triggered by {}: job {} ({})",
            schedule_id,
            source,
            job_id,
            run.job_type()
        );
        self.track(run, Some(schedule_id), Some(history), Some(timeout)).await;
        Ok(job_id)
    }

    /// Create a run that belongs to no schedule
    pub async fn trigger_adhoc(&self, job_type: &str, parameters: JobParameters) -> Result<JobId> {
        let priority = JobPriority::new(self.defaults.default_priority)?;
        let run = JobRun::new(job_type, parameters)?
            .with_priority(priority)
            .with_retry_limit(self.defaults.max_retry_attempts)
            .with_stage_policy(self.defaults.stage_totals);
        let job_id = run.id();

        tracing::info!("Ad-hoc job {} ({}) created", job_id, job_type);
        self.track(run, None, None, Some(self.defaults.timeout())).await;
        Ok(job_id)
    }

    /// Create the next attempt of a failed run; it inherits the schedule link
    ///
    /// A run is retried at most once. Further attempts chain from the retry.
    pub async fn retry_job(&self, job_id: JobId) -> Result<JobId> {
        let now = Utc::now();
        let (run, schedule_id, timeout) = {
            let mut jobs = self.jobs.write().await;
            let tracked = jobs.get_mut(&job_id).ok_or_else(|| not_found(job_id))?;
            if let Some(successor) = tracked.retried_as {
                tracing::debug!("Job {} was already retried as {}", job_id, successor);
                return Err(JobError::transition("job", "retried", "retry"));
            }
            let run = tracked.run.retry(now)?;
            tracked.retried_as = Some(run.id());
            (run, tracked.schedule_id, tracked.timeout)
        };

        let delay = run.next_retry_delay(&self.defaults.retry_policy());
        let history = schedule_id
            .map(|id| RunHistory::open(id, TriggerSource::Scheduler).with_job_run(run.id()));
        let next_id = run.id();
        tracing::info!(
            "Job {} retried as {} (attempt {}, suggested delay {:?})",
            job_id,
            next_id,
            run.retry_count(),
            delay
        );
        self.track(run, schedule_id, history, timeout).await;
        Ok(next_id)
    }

    async fn track(
        &self,
        run: JobRun,
        schedule_id: Option<JobId>,
        history: Option<RunHistory>,
        timeout: Option<Duration>,
    ) {
        let event = JobEvent {
            job_id: run.id(),
            old_status: run.status(),
            new_status: run.status(),
            progress: run.progress(),
            timestamp: Utc::now(),
            message: Some("Job created".to_string()),
        };
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                run.id(),
                TrackedJob {
                    run,
                    schedule_id,
                    history,
                    processing: None,
                    cancellation_token: CancellationToken::new(),
                    timeout,
                    timed_out: false,
                    retried_as: None,
                },
            );
        }
        self.emit(event);
    }

    /// Track the per-item state of an image processing run
    ///
    /// The state is brought up to the run's current status first, so it can
    /// be attached before or after `start_job`.
    pub async fn attach_processing(&self, job_id: JobId, mut state: ResumableProcessingState) -> Result<()> {
        if state.job_id() != job_id {
            return Err(JobError::invalid_input(format!(
                "Processing state belongs to job {}, not {}",
                state.job_id(),
                job_id
            )));
        }
        {
            let mut jobs = self.jobs.write().await;
            let tracked = jobs.get_mut(&job_id).ok_or_else(|| not_found(job_id))?;
            if tracked.run.is_terminal() {
                return Err(JobError::transition("job", tracked.run.status(), "attach state to"));
            }
            align_processing(&mut state, tracked.run.status())?;
            tracked.processing = Some(state.clone());
        }
        self.persist(Some(state)).await
    }

    // ---- queries ----

    pub async fn job(&self, job_id: JobId) -> Option<JobRun> {
        self.jobs.read().await.get(&job_id).map(|t| t.run.clone())
    }

    pub async fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.jobs.read().await.get(&job_id).map(|t| t.run.status())
    }

    pub async fn processing_state(&self, job_id: JobId) -> Option<ResumableProcessingState> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .and_then(|t| t.processing.clone())
    }

    pub async fn cancellation_token(&self, job_id: JobId) -> Option<CancellationToken> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|t| t.cancellation_token.clone())
    }

    /// Ids of all non-terminal runs
    pub async fn active_jobs(&self) -> Vec<JobId> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|t| !t.run.is_terminal())
            .map(|t| t.run.id())
            .collect()
    }

    /// Successor created by `retry_job` for a failed run
    pub async fn retried_as(&self, job_id: JobId) -> Option<JobId> {
        self.jobs.read().await.get(&job_id).and_then(|t| t.retried_as)
    }

    /// Sealed history of a schedule, oldest first
    pub async fn history_for(&self, schedule_id: JobId) -> Vec<RunHistory> {
        self.history
            .read()
            .await
            .iter()
            .filter(|h| h.schedule_id() == schedule_id)
            .cloned()
            .collect()
    }

    /// Running processing jobs without progress within the configured window
    pub async fn stale_jobs(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let threshold = self.defaults.stale_after();
        self.jobs
            .read()
            .await
            .values()
            .filter(|t| t.processing.as_ref().is_some_and(|p| p.is_stale(now, threshold)))
            .map(|t| t.run.id())
            .collect()
    }

    /// Stop tracking a finished run
    ///
    /// Sealed history stays with its schedule; persisted processing state is
    /// left to the store.
    pub async fn remove_job(&self, job_id: JobId) -> Result<JobRun> {
        let mut jobs = self.jobs.write().await;
        let tracked = jobs.get(&job_id).ok_or_else(|| not_found(job_id))?;
        if !tracked.run.is_terminal() {
            return Err(JobError::transition("job", tracked.run.status(), "remove"));
        }
        let removed = jobs.remove(&job_id).ok_or_else(|| not_found(job_id))?;
        tracing::debug!("Removed finished job {}", job_id);
        Ok(removed.run)
    }

    /// Drop every finished run that completed before `older_than`
    pub async fn cleanup_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, tracked| {
            let run = &tracked.run;
            !run.is_terminal() || run.completed_at().unwrap_or(run.created_at()) >= older_than
        });
        let removed = before - jobs.len();
        if removed > 0 {
            tracing::info!("Cleaned up {} finished jobs, {} still tracked", removed, jobs.len());
        } else {
            tracing::debug!("Performing job cleanup, nothing to remove");
        }
        removed
    }

    // ---- worker callbacks ----

    /// Start a pending run; the token signals cooperative cancellation
    pub async fn start_job(&self, job_id: JobId) -> Result<CancellationToken> {
        self.apply(job_id, |tracked| {
            tracked.run.start()?;
            if let Some(processing) = tracked.processing.as_mut() {
                if processing.status().permits(JobAction::Start) {
                    processing.start()?;
                }
            }
            Ok(tracked.cancellation_token.clone())
        })
        .await
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<Revision> {
        self.apply(job_id, |tracked| {
            let revision = tracked.run.pause()?;
            sync_processing(tracked, JobAction::Pause);
            Ok(revision)
        })
        .await
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<Revision> {
        self.apply(job_id, |tracked| {
            let revision = tracked.run.resume()?;
            sync_processing(tracked, JobAction::Resume);
            Ok(revision)
        })
        .await
    }

    pub async fn report_progress(&self, job_id: JobId, completed: i64, total: i64) -> Result<Revision> {
        self.apply(job_id, |tracked| tracked.run.update_progress(completed, total))
            .await
    }

    /// Run an arbitrary mutation against a live run, e.g. stage reporting
    pub async fn update_job<F>(&self, job_id: JobId, mutate: F) -> Result<Revision>
    where
        F: FnOnce(&mut JobRun) -> Result<Revision> + Send,
    {
        self.apply(job_id, |tracked| mutate(&mut tracked.run)).await
    }

    /// Returns `false` when the item was already reported
    pub async fn report_item_completed(&self, job_id: JobId, item_id: &str, size_bytes: u64) -> Result<bool> {
        self.apply(job_id, |tracked| {
            let processing = processing_mut(tracked)?;
            let recorded = processing.increment_completed(item_id, size_bytes)?;
            if recorded {
                sync_item_progress(tracked, item_id)?;
            }
            Ok(recorded)
        })
        .await
    }

    /// Returns `false` when the item was already reported
    pub async fn report_item_failed(&self, job_id: JobId, item_id: &str, kind: ErrorKind) -> Result<bool> {
        self.apply(job_id, |tracked| {
            let processing = processing_mut(tracked)?;
            let recorded = processing.increment_failed(item_id)?;
            if recorded {
                processing.track_error(kind.clone());
                tracked.run.add_error(format!("{}: {}", item_id, kind));
                sync_item_progress(tracked, item_id)?;
            }
            Ok(recorded)
        })
        .await
    }

    /// Returns `false` when the item was already reported
    pub async fn report_item_skipped(&self, job_id: JobId, item_id: &str) -> Result<bool> {
        self.apply(job_id, |tracked| {
            let processing = processing_mut(tracked)?;
            let recorded = processing.increment_skipped(item_id)?;
            if recorded {
                sync_item_progress(tracked, item_id)?;
            }
            Ok(recorded)
        })
        .await
    }

    pub async fn complete_job(&self, job_id: JobId, result: Option<serde_json::Value>) -> Result<Revision> {
        self.apply(job_id, |tracked| {
            let has_errors = tracked.processing.as_ref().is_some_and(|p| p.has_errors());
            let revision = if has_errors {
                tracked.run.complete_with_errors(result)?
            } else {
                tracked.run.complete(result)?
            };
            complete_processing(tracked);
            Ok(revision)
        })
        .await
    }

    pub async fn complete_job_with_errors(
        &self,
        job_id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<Revision> {
        self.apply(job_id, |tracked| {
            let revision = tracked.run.complete_with_errors(result)?;
            complete_processing(tracked);
            Ok(revision)
        })
        .await
    }

    pub async fn fail_job(&self, job_id: JobId, message: &str) -> Result<Revision> {
        self.apply(job_id, |tracked| {
            let revision = tracked.run.fail(message)?;
            if let Some(processing) = tracked.processing.as_mut() {
                if processing.status().permits(JobAction::Fail) {
                    processing.fail(message)?;
                }
            }
            Ok(revision)
        })
        .await
    }

    /// Record cancellation and signal the worker through its token
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Revision> {
        self.apply(job_id, |tracked| {
            let revision = tracked.run.cancel()?;
            sync_processing(tracked, JobAction::Cancel);
            tracked.cancellation_token.cancel();
            Ok(revision)
        })
        .await
    }

    /// Fail every started job whose timeout elapsed before `now`
    ///
    /// The clock runs from `started_at`, so time spent paused counts. A paused
    /// run is resumed and failed in one write.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let timed_out: Vec<JobId> = {
            let jobs = self.jobs.read().await;
            jobs.values()
                .filter(|t| matches!(t.run.status(), JobStatus::Running | JobStatus::Paused))
                .filter(|t| match (t.timeout, t.run.elapsed(now)) {
                    (Some(limit), Some(elapsed)) => elapsed > limit,
                    _ => false,
                })
                .map(|t| t.run.id())
                .collect()
        };

        let mut handled = Vec::new();
        for job_id in timed_out {
            tracing::warn!("Job {} timed out, failing", job_id);
            let outcome = self
                .apply_at(job_id, now, |tracked| {
                    let minutes = tracked.timeout.map_or(0, |t| t.num_minutes());
                    let message = format!("Job timed out after {} minutes", minutes);
                    if tracked.run.status() == JobStatus::Paused {
                        tracked.run.resume()?;
                        sync_processing(tracked, JobAction::Resume);
                    }
                    let revision = tracked.run.fail(message.clone())?;
                    if let Some(processing) = tracked.processing.as_mut() {
                        if processing.status().permits(JobAction::Fail) {
                            processing.fail(message)?;
                        }
                    }
                    tracked.timed_out = true;
                    tracked.cancellation_token.cancel();
                    Ok(revision)
                })
                .await;

            match outcome {
                Ok(_) => handled.push(job_id),
                // A worker may have finished the job between the sweep and the write.
                Err(e) if e.is_invalid_transition() => {
                    tracing::debug!("Job {} finished before its timeout was applied", job_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(handled)
    }

    async fn apply<T, F>(&self, job_id: JobId, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut TrackedJob) -> Result<T> + Send,
    {
        self.apply_at(job_id, Utc::now(), mutate).await
    }

    /// Run `mutate` under the write lock, then settle its side effects
    ///
    /// `mutate` must leave the job untouched when it fails; the records it
    /// calls into guarantee that for each individual write.
    async fn apply_at<T, F>(&self, job_id: JobId, now: DateTime<Utc>, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut TrackedJob) -> Result<T> + Send,
    {
        let applied = {
            let mut jobs = self.jobs.write().await;
            let tracked = jobs.get_mut(&job_id).ok_or_else(|| not_found(job_id))?;
            let old_status = tracked.run.status();
            let old_revision = tracked.run.revision();
            let persist_before = tracked.processing.as_ref().map(|p| p.revision());

            let value = mutate(tracked)?;

            let new_status = tracked.run.status();
            let event = (old_status != new_status || old_revision != tracked.run.revision()).then(|| {
                JobEvent {
                    job_id,
                    old_status,
                    new_status,
                    progress: tracked.run.progress(),
                    timestamp: now,
                    message: tracked.run.message().map(str::to_string),
                }
            });

            let finished = if !old_status.is_terminal() && new_status.is_terminal() {
                seal_history(tracked, now)?
            } else {
                None
            };

            let persist = match &tracked.processing {
                Some(p) if Some(p.revision()) != persist_before => Some(p.clone()),
                _ => None,
            };

            Applied {
                value,
                event,
                finished,
                persist,
            }
        };

        if let Some(finished) = applied.finished {
            self.record_schedule_run(finished, now).await?;
        }
        self.persist(applied.persist).await?;
        if let Some(event) = applied.event {
            self.emit(event);
        }
        Ok(applied.value)
    }

    async fn record_schedule_run(&self, finished: FinishedRun, now: DateTime<Utc>) -> Result<()> {
        {
            let mut history = self.history.write().await;
            history.push(finished.history);
            trim_history(&mut history, finished.schedule_id, self.defaults.history_limit);
        }

        let mut schedules = self.schedules.write().await;
        let Some(schedule) = schedules.get_mut(&finished.schedule_id) else {
            tracing::warn!(
                "Schedule {} vanished before its run could be recorded",
                finished.schedule_id
            );
            return Ok(());
        };

        schedule.record_job_run(
            finished.started_at,
            finished.ended_at,
            finished.status,
            finished.error.as_deref(),
        )?;

        if schedule.is_enabled() {
            match self.calculator.next_run(schedule, now) {
                Some(next) => {
                    schedule.update_next_run_time(next);
                }
                None => {
                    schedule.clear_next_run_time();
                }
            }
        }
        Ok(())
    }

    async fn persist(&self, state: Option<ResumableProcessingState>) -> Result<()> {
        match (&self.store, state) {
            (Some(store), Some(state)) => store.save(&state).await,
            _ => Ok(()),
        }
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is not an error.
        if self.status_sender.send(event).is_err() {
            tracing::trace!("No subscribers for job events");
        }
    }
}

fn not_found(id: JobId) -> JobError {
    JobError::NotFound { id: id.to_string() }
}

fn processing_mut(tracked: &mut TrackedJob) -> Result<&mut ResumableProcessingState> {
    let job_id = tracked.run.id();
    let status = tracked.run.status();
    if !status.permits(JobAction::UpdateProgress) {
        return Err(JobError::transition("job", status, "report an item for"));
    }
    tracked.processing.as_mut().ok_or_else(|| {
        JobError::invalid_input(format!("Job {} does not track individual items", job_id))
    })
}

/// Bring a newly attached processing state to the status of its run
fn align_processing(state: &mut ResumableProcessingState, target: JobStatus) -> Result<()> {
    if target == JobStatus::Pending {
        return Ok(());
    }
    if state.status() == JobStatus::Pending {
        state.start()?;
    }
    match (target, state.status()) {
        (JobStatus::Running, JobStatus::Paused) => {
            state.resume()?;
        }
        (JobStatus::Paused, JobStatus::Running) => {
            state.pause()?;
        }
        _ => {}
    }
    if state.status() != target {
        return Err(JobError::transition(
            "processing state",
            state.status(),
            format!("attach to a {} job", target),
        ));
    }
    Ok(())
}

/// Keep at most `limit` sealed records per schedule, dropping the oldest
fn trim_history(history: &mut Vec<RunHistory>, schedule_id: JobId, limit: usize) {
    if limit == 0 {
        return;
    }
    let count = history.iter().filter(|h| h.schedule_id() == schedule_id).count();
    let mut excess = count.saturating_sub(limit);
    if excess == 0 {
        return;
    }
    history.retain(|h| {
        if excess > 0 && h.schedule_id() == schedule_id {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

/// Mirror a lifecycle action onto the processing state when it allows it
fn sync_processing(tracked: &mut TrackedJob, action: JobAction) {
    let Some(processing) = tracked.processing.as_mut() else {
        return;
    };
    if !processing.status().permits(action) {
        tracing::warn!(
            "Processing state of job {} is {}, not applying {}",
            processing.job_id(),
            processing.status(),
            action
        );
        return;
    }
    let outcome = match action {
        JobAction::Pause => processing.pause(),
        JobAction::Resume => processing.resume(),
        JobAction::Cancel => processing.cancel(),
        _ => return,
    };
    if let Err(e) = outcome {
        tracing::warn!("Failed to {} processing state: {}", action, e);
    }
}

fn complete_processing(tracked: &mut TrackedJob) {
    if let Some(processing) = tracked.processing.as_mut() {
        if processing.status() == JobStatus::Running {
            if let Err(e) = processing.complete() {
                tracing::warn!("Failed to complete processing state: {}", e);
            }
        }
    }
}

/// Copy item counters from the processing state onto the run
fn sync_item_progress(tracked: &mut TrackedJob, item_id: &str) -> Result<()> {
    let Some(processing) = tracked.processing.as_ref() else {
        return Ok(());
    };
    let handled = i64::try_from(processing.handled_images()).unwrap_or(i64::MAX);
    let total = i64::try_from(processing.total_images()).unwrap_or(i64::MAX);

    tracked.run.set_current_item(item_id)?;
    if !tracked.run.is_multi_stage() {
        tracked.run.update_progress(handled, total)?;
    }
    Ok(())
}

/// Seal the open history record of a run that just became terminal
fn seal_history(tracked: &mut TrackedJob, now: DateTime<Utc>) -> Result<Option<FinishedRun>> {
    let (Some(schedule_id), Some(history)) = (tracked.schedule_id, tracked.history.as_mut()) else {
        return Ok(None);
    };
    if history.is_terminal() {
        return Ok(None);
    }

    let run = &tracked.run;
    let ended_at = run.completed_at().unwrap_or(now);

    let (status, error) = match run.status() {
        JobStatus::Completed if run.has_errors() => {
            history.complete_at(run.result().cloned(), ended_at)?;
            ("CompletedWithErrors", None)
        }
        JobStatus::Completed => {
            history.complete_at(run.result().cloned(), ended_at)?;
            ("Completed", None)
        }
        JobStatus::Failed if tracked.timed_out => {
            history.timeout_at(ended_at)?;
            ("Timeout", run.message().map(str::to_string))
        }
        JobStatus::Failed => {
            let message = run.message().unwrap_or("failed").to_string();
            history.fail_at(message.clone(), ended_at)?;
            ("Failed", Some(message))
        }
        JobStatus::Cancelled => {
            history.fail_at("cancelled", ended_at)?;
            ("Cancelled", Some("cancelled".to_string()))
        }
        JobStatus::Pending | JobStatus::Running | JobStatus::Paused => return Ok(None),
    };

    Ok(Some(FinishedRun {
        schedule_id,
        history: history.clone(),
        started_at: history.started_at(),
        ended_at: ended_at.max(history.started_at()),
        status,
        error,
    }))
}
