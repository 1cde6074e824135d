//! Scheduler and admission queue.
//!
//! The scheduler owns the ordering of pending jobs and the admission policy
//! (deduplication and capacity). Job state itself lives in the
//! [`JobStore`]; every transition goes through a compare-and-swap update.
//!
//! All queue operations take the same internal lock, which makes enqueue,
//! claim, cancel and the retry requeue linearizable with respect to each
//! other. The lock is never held across an `.await`.

use crate::decision::{Decision, SkipReason};
use crate::job::{
    current_timestamp_ms, FailureKind, Job, JobId, JobState, JobUpdate, WorkerId,
    MAX_CRASH_RECOVERIES,
};
use crate::store::{JobFilter, JobStore, StoreError};
use recodex_config::WorkerConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exponential retry delay: `min(base * 2^(attempts - 1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay before the retry that follows attempt number `attempts`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of pending jobs.
    pub queue_capacity: usize,
    /// Attempts allowed per job.
    pub retry_limit: u32,
    pub backoff: BackoffPolicy,
    /// Upper bound on how long [`Scheduler::next`] waits for work.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for SchedulerConfig {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            retry_limit: cfg.retry_limit,
            backoff: BackoffPolicy {
                base: Duration::from_millis(cfg.retry_backoff_ms),
                max: Duration::from_millis(cfg.retry_backoff_max_ms.max(cfg.retry_backoff_ms)),
            },
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(10)),
        }
    }
}

/// Admission-time rejection. Never recorded as a job.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("job {existing} is already {state} for {}", path.display())]
    Duplicate {
        existing: JobId,
        state: JobState,
        path: PathBuf,
    },

    #[error("queue full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    /// The decision was to skip the file.
    #[error("not queued: {0}")]
    Skipped(SkipReason),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from cancel and reprocess requests.
#[derive(Debug, Error)]
pub enum JobControlError {
    #[error("job {id} is {state} and cannot be cancelled")]
    NotCancellable { id: JobId, state: JobState },

    #[error("job {id} is {state}; only finished jobs can be reprocessed")]
    NotReprocessable { id: JobId, state: JobState },

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A job claimed by a worker, with the token used to request its cancellation.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub cancel: CancellationToken,
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Requeued; claimable from `not_before` (unix ms).
    Retrying { attempt: u32, not_before: i64 },
    /// No attempts left; the job stays failed.
    Exhausted,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled,
    /// The job is running; its worker has been asked to stop.
    Requested,
}

/// What [`Scheduler::reconcile`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Running jobs reset to pending.
    pub recovered: usize,
    /// Failed jobs with attempts left put back in the queue.
    pub requeued: usize,
    /// Running jobs failed for good after too many crash recoveries.
    pub abandoned: usize,
    /// Pending jobs in the queue afterwards.
    pub queued: usize,
}

/// Queue depth, as reported by the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    /// Pending jobs whose backoff has elapsed.
    pub ready: usize,
    pub running: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    id: JobId,
    sequence: u64,
    ready_at: i64,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Pending jobs ordered by admission sequence.
    pending: VecDeque<QueueEntry>,
    running: HashMap<JobId, CancellationToken>,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry) {
        let pos = self
            .pending
            .iter()
            .position(|e| e.sequence > entry.sequence)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, entry);
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.pending.iter().position(|e| e.id == id) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// FIFO scheduler with bounded admission.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler over `store`.
    ///
    /// The queue starts empty; call [`Scheduler::reconcile`] to pick up jobs
    /// already in the store.
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a decided file.
    ///
    /// Fails with [`AdmissionError::Duplicate`] when a pending or running job
    /// already targets the same source and output, and with
    /// [`AdmissionError::QueueFull`] when the queue is at capacity.
    pub fn enqueue(
        &self,
        path: &Path,
        decision: Decision,
        dry_run: bool,
    ) -> Result<JobId, AdmissionError> {
        let mut plan = match decision {
            Decision::Transcode(plan) => plan,
            Decision::Skip(reason) => {
                debug!(path = %path.display(), reason = %reason, "Skipping file");
                return Err(AdmissionError::Skipped(reason));
            }
        };
        plan.source = path.to_path_buf();
        self.admit(Job::new(plan, self.config.retry_limit, dry_run))
    }

    fn admit(&self, job: Job) -> Result<JobId, AdmissionError> {
        let mut state = self.lock();

        let active = self
            .store
            .list(&JobFilter::active().with_source(job.source_path.clone()))?;
        if let Some(existing) = active.iter().find(|j| j.plan.output == job.plan.output) {
            warn!(
                job_id = %existing.id,
                path = %job.source_path.display(),
                "Rejected duplicate job"
            );
            return Err(AdmissionError::Duplicate {
                existing: existing.id.clone(),
                state: existing.state,
                path: job.source_path.clone(),
            });
        }

        if state.pending.len() >= self.config.queue_capacity {
            warn!(
                path = %job.source_path.display(),
                capacity = self.config.queue_capacity,
                "Queue full"
            );
            return Err(AdmissionError::QueueFull {
                capacity: self.config.queue_capacity,
            });
        }

        let source = job.source_path.clone();
        let profile = job.profile.clone();
        let dry_run = job.dry_run;
        let id = self.store.create(job)?;
        let sequence = self.store.get(&id)?.sequence;
        state.insert(QueueEntry {
            id: id.clone(),
            sequence,
            ready_at: 0,
        });
        drop(state);

        info!(
            job_id = %id,
            path = %source.display(),
            profile = %profile,
            dry_run,
            "Job queued"
        );
        self.notify.notify_one();
        Ok(id)
    }

    /// Claim the oldest ready job without waiting.
    pub fn try_next(&self, worker: WorkerId) -> Result<Option<ClaimedJob>, StoreError> {
        let mut state = self.lock();
        let now = current_timestamp_ms();

        while let Some(pos) = state.pending.iter().position(|e| e.ready_at <= now) {
            let entry = match state.pending.remove(pos) {
                Some(entry) => entry,
                None => break,
            };
            match self
                .store
                .update(&entry.id, JobState::Pending, JobUpdate::Claim { worker })
            {
                Ok(job) => {
                    let cancel = CancellationToken::new();
                    state.running.insert(job.id.clone(), cancel.clone());
                    info!(
                        job_id = %job.id,
                        worker,
                        attempt = job.attempts,
                        path = %job.source_path.display(),
                        "Job claimed"
                    );
                    return Ok(Some(ClaimedJob { job, cancel }));
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    warn!(job_id = %entry.id, state = %actual, "Dropping stale queue entry");
                }
                Err(StoreError::NotFound(_)) => {
                    warn!(job_id = %entry.id, "Dropping queue entry for missing job");
                }
                Err(e) => {
                    state.insert(entry);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Claim the oldest ready job, waiting a bounded time for one.
    ///
    /// Wakes on new work or after the poll interval (or the next backoff
    /// expiry, whichever is sooner). Returns `None` if nothing became ready.
    pub async fn next(&self, worker: WorkerId) -> Result<Option<ClaimedJob>, StoreError> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(claimed) = self.try_next(worker)? {
            return Ok(Some(claimed));
        }

        let wait = self.wait_hint();
        let _ = tokio::time::timeout(wait, notified).await;
        self.try_next(worker)
    }

    fn wait_hint(&self) -> Duration {
        let state = self.lock();
        let now = current_timestamp_ms();
        let earliest = state.pending.iter().map(|e| e.ready_at).min();
        match earliest {
            Some(ready_at) if ready_at > now => {
                let until = Duration::from_millis((ready_at - now) as u64);
                until.min(self.config.poll_interval).max(Duration::from_millis(5))
            }
            _ => self.config.poll_interval,
        }
    }

    /// Record encoder progress for a running job.
    pub fn report_progress(&self, id: &str, percent: f32) -> Result<(), StoreError> {
        self.store
            .update(id, JobState::Running, JobUpdate::Progress { percent })?;
        Ok(())
    }

    /// Mark a running job completed.
    ///
    /// A cancel request that arrived before this call wins: the job is moved
    /// to `cancelled` instead and returned in that state.
    pub fn complete(
        &self,
        id: &str,
        bytes_before: Option<u64>,
        bytes_after: Option<u64>,
        dry_run: bool,
    ) -> Result<Job, StoreError> {
        let mut state = self.lock();
        let cancelled = state
            .running
            .remove(id)
            .map_or(false, |token| token.is_cancelled());
        if cancelled {
            let job = self.store.update(
                id,
                JobState::Running,
                JobUpdate::Cancel {
                    reason: "cancelled by request".to_string(),
                },
            )?;
            info!(job_id = %id, "Job cancelled before completion was recorded");
            return Ok(job);
        }
        let job = self.store.update(
            id,
            JobState::Running,
            JobUpdate::Complete {
                bytes_before,
                bytes_after,
                dry_run,
            },
        )?;
        info!(
            job_id = %id,
            dry_run,
            bytes_before = ?bytes_before,
            bytes_after = ?bytes_after,
            "Job completed"
        );
        Ok(job)
    }

    /// Mark a running job failed, requeueing it with backoff while attempts remain.
    pub fn fail(&self, id: &str, kind: FailureKind, error: &str) -> Result<FailOutcome, StoreError> {
        let mut state = self.lock();
        state.running.remove(id);
        let job = self.store.update(
            id,
            JobState::Running,
            JobUpdate::Fail {
                kind,
                error: error.to_string(),
            },
        )?;

        if !job.is_retryable() {
            warn!(
                job_id = %id,
                attempts = job.attempts,
                kind = %kind,
                error,
                "Job failed permanently"
            );
            return Ok(FailOutcome::Exhausted);
        }

        let delay = self.config.backoff.delay(job.attempts);
        let not_before = current_timestamp_ms() + delay.as_millis() as i64;
        let job = self
            .store
            .update(id, JobState::Failed, JobUpdate::Requeue { not_before })?;
        state.insert(QueueEntry {
            id: job.id.clone(),
            sequence: job.sequence,
            ready_at: not_before,
        });
        drop(state);

        warn!(
            job_id = %id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            kind = %kind,
            error,
            retry_in_ms = delay.as_millis() as u64,
            "Job failed, retry scheduled"
        );
        self.notify.notify_one();
        Ok(FailOutcome::Retrying {
            attempt: job.attempts + 1,
            not_before,
        })
    }

    /// Mark a running job cancelled after its worker stopped the encoder.
    pub fn mark_cancelled(&self, id: &str, reason: &str) -> Result<Job, StoreError> {
        let mut state = self.lock();
        state.running.remove(id);
        let job = self.store.update(
            id,
            JobState::Running,
            JobUpdate::Cancel {
                reason: reason.to_string(),
            },
        )?;
        info!(job_id = %id, reason, "Job cancelled");
        Ok(job)
    }

    /// Hand a running job back to the queue without counting the attempt.
    ///
    /// Used when a worker stops for shutdown.
    pub fn release(&self, id: &str, reason: &str) -> Result<Job, StoreError> {
        let mut state = self.lock();
        state.running.remove(id);
        let job = self.store.update(
            id,
            JobState::Running,
            JobUpdate::Recover {
                reason: reason.to_string(),
                crashed: false,
            },
        )?;
        state.insert(QueueEntry {
            id: job.id.clone(),
            sequence: job.sequence,
            ready_at: 0,
        });
        info!(job_id = %id, reason, "Job released");
        Ok(job)
    }

    /// Cancel a job.
    ///
    /// Pending jobs are cancelled immediately and never start. For running
    /// jobs the owning worker is signalled and finishes the transition.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, JobControlError> {
        let mut state = self.lock();
        let job = self.store.get(id)?;

        match job.state {
            JobState::Pending => {
                state.remove(id);
                self.store.update(
                    id,
                    JobState::Pending,
                    JobUpdate::Cancel {
                        reason: "cancelled by request".to_string(),
                    },
                )?;
                info!(job_id = %id, "Pending job cancelled");
                Ok(CancelOutcome::Cancelled)
            }
            JobState::Running => match state.running.get(id) {
                Some(token) => {
                    token.cancel();
                    info!(job_id = %id, worker = ?job.owner, "Cancellation requested");
                    Ok(CancelOutcome::Requested)
                }
                None => {
                    // No live worker holds it; finish the transition here
                    self.store.update(
                        id,
                        JobState::Running,
                        JobUpdate::Cancel {
                            reason: "cancelled by request (no live worker)".to_string(),
                        },
                    )?;
                    info!(job_id = %id, "Orphaned running job cancelled");
                    Ok(CancelOutcome::Cancelled)
                }
            },
            other => Err(JobControlError::NotCancellable {
                id: id.to_string(),
                state: other,
            }),
        }
    }

    /// Create a fresh job for a finished job's source and plan.
    ///
    /// The original job is left untouched. Subject to normal admission.
    pub fn reprocess(&self, id: &str) -> Result<JobId, JobControlError> {
        let job = self.store.get(id)?;
        if !job.is_terminal() {
            return Err(JobControlError::NotReprocessable {
                id: id.to_string(),
                state: job.state,
            });
        }
        let fresh = Job::new(job.plan.clone(), self.config.retry_limit, job.dry_run);
        let new_id = self.admit(fresh)?;
        info!(job_id = %new_id, previous = %id, "Job reprocessed");
        Ok(new_id)
    }

    /// Rebuild the queue from the store.
    ///
    /// Running jobs have no live owner at this point and go back to pending;
    /// failed jobs with attempts left are requeued. Must run before any
    /// worker starts claiming.
    pub fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut state = self.lock();
        let mut report = ReconcileReport::default();
        state.pending.clear();
        state.running.clear();

        for job in self.store.list(&JobFilter::all())? {
            let job = match job.state {
                JobState::Running if job.recoveries >= MAX_CRASH_RECOVERIES => {
                    error!(
                        job_id = %job.id,
                        recoveries = job.recoveries,
                        path = %job.source_path.display(),
                        "Job interrupted by repeated crashes, giving up"
                    );
                    report.abandoned += 1;
                    self.store.update(
                        &job.id,
                        JobState::Running,
                        JobUpdate::Fail {
                            kind: FailureKind::Interrupted,
                            error: format!(
                                "interrupted {} times by a daemon restart",
                                job.recoveries + 1
                            ),
                        },
                    )?
                }
                JobState::Running => {
                    warn!(job_id = %job.id, worker = ?job.owner, "Recovering job left running");
                    report.recovered += 1;
                    self.store.update(
                        &job.id,
                        JobState::Running,
                        JobUpdate::Recover {
                            reason: "recovered at startup".to_string(),
                            crashed: true,
                        },
                    )?
                }
                JobState::Failed if job.is_retryable() => {
                    report.requeued += 1;
                    self.store.update(
                        &job.id,
                        JobState::Failed,
                        JobUpdate::Requeue {
                            not_before: current_timestamp_ms(),
                        },
                    )?
                }
                _ => job,
            };

            if job.state == JobState::Pending {
                state.insert(QueueEntry {
                    id: job.id.clone(),
                    sequence: job.sequence,
                    ready_at: job.not_before.unwrap_or(0),
                });
            }
        }

        report.queued = state.pending.len();
        drop(state);

        info!(
            recovered = report.recovered,
            requeued = report.requeued,
            abandoned = report.abandoned,
            queued = report.queued,
            "Queue reconciled"
        );
        self.notify.notify_waiters();
        Ok(report)
    }

    /// Current queue depth.
    pub fn queue_status(&self) -> QueueStatus {
        let state = self.lock();
        let now = current_timestamp_ms();
        QueueStatus {
            pending: state.pending.len(),
            ready: state.pending.iter().filter(|e| e.ready_at <= now).count(),
            running: state.running.len(),
            capacity: self.config.queue_capacity,
        }
    }

    /// Wake every waiting worker.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::sample_plan;
    use crate::store::MemoryJobStore;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn config(capacity: usize, retry_limit: u32, backoff_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            queue_capacity: capacity,
            retry_limit,
            backoff: BackoffPolicy {
                base: Duration::from_millis(backoff_ms),
                max: Duration::from_millis(backoff_ms * 8),
            },
            poll_interval: Duration::from_millis(50),
        }
    }

    fn scheduler(capacity: usize, retry_limit: u32, backoff_ms: u64) -> Scheduler {
        Scheduler::new(
            Arc::new(MemoryJobStore::new()),
            config(capacity, retry_limit, backoff_ms),
        )
    }

    fn transcode(source: &str) -> Decision {
        Decision::Transcode(sample_plan(source))
    }

    fn enqueue(s: &Scheduler, source: &str) -> Result<JobId, AdmissionError> {
        s.enqueue(Path::new(source), transcode(source), false)
    }

    #[test]
    fn test_duplicate_is_rejected_while_active() {
        let s = scheduler(10, 3, 0);
        let first = enqueue(&s, "/m/a.mkv").unwrap();

        match enqueue(&s, "/m/a.mkv") {
            Err(AdmissionError::Duplicate { existing, state, .. }) => {
                assert_eq!(existing, first);
                assert_eq!(state, JobState::Pending);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }

        let claimed = s.try_next(0).unwrap().unwrap();
        assert!(matches!(
            enqueue(&s, "/m/a.mkv"),
            Err(AdmissionError::Duplicate {
                state: JobState::Running,
                ..
            })
        ));

        s.complete(&claimed.job.id, Some(100), Some(60), false).unwrap();
        assert!(enqueue(&s, "/m/a.mkv").is_ok());
        assert_eq!(s.store().list(&JobFilter::all()).unwrap().len(), 2);
    }

    #[test]
    fn test_same_source_different_output_is_not_duplicate() {
        let s = scheduler(10, 3, 0);
        enqueue(&s, "/m/a.mkv").unwrap();

        let mut other = sample_plan("/m/a.mkv");
        other.output = PathBuf::from("/m/a_small_file.mp4");
        other.profile = "small_file".to_string();
        assert!(s
            .enqueue(Path::new("/m/a.mkv"), Decision::Transcode(other), false)
            .is_ok());
    }

    #[test]
    fn test_queue_full_creates_no_job() {
        let s = scheduler(2, 3, 0);
        enqueue(&s, "/m/a.mkv").unwrap();
        enqueue(&s, "/m/b.mkv").unwrap();

        assert!(matches!(
            enqueue(&s, "/m/c.mkv"),
            Err(AdmissionError::QueueFull { capacity: 2 })
        ));
        assert_eq!(s.store().list(&JobFilter::all()).unwrap().len(), 2);

        // Claiming frees a slot
        s.try_next(0).unwrap().unwrap();
        assert!(enqueue(&s, "/m/c.mkv").is_ok());
    }

    #[test]
    fn test_skip_decision_is_not_admitted() {
        let s = scheduler(10, 3, 0);
        let result = s.enqueue(
            Path::new("/m/a.mp4"),
            Decision::Skip(SkipReason::AlreadyMatchesTarget),
            false,
        );
        assert!(matches!(
            result,
            Err(AdmissionError::Skipped(SkipReason::AlreadyMatchesTarget))
        ));
        assert!(s.store().list(&JobFilter::all()).unwrap().is_empty());
    }

    #[test]
    fn test_claims_are_fifo() {
        let s = scheduler(10, 3, 0);
        let ids: Vec<_> = ["/m/1.mkv", "/m/2.mkv", "/m/3.mkv"]
            .iter()
            .map(|p| enqueue(&s, p).unwrap())
            .collect();

        let claimed: Vec<_> = (0..3)
            .map(|w| s.try_next(w).unwrap().unwrap().job.id)
            .collect();
        assert_eq!(claimed, ids);
        assert!(s.try_next(0).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_duplicate() {
        let s = Arc::new(scheduler(100, 3, 0));
        for i in 0..5 {
            enqueue(&s, &format!("/m/{}.mkv", i)).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { s.try_next(worker).unwrap().map(|c| c.job.id) })
            })
            .collect();

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                claimed.push(id);
            }
        }
        let unique: HashSet<_> = claimed.iter().cloned().collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_same_path_admits_one() {
        let s = Arc::new(scheduler(100, 3, 0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { enqueue(&s, "/m/same.mkv").is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(s.store().list(&JobFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_job_is_retried_until_limit() {
        let s = scheduler(10, 2, 0);
        let id = enqueue(&s, "/m/a.mkv").unwrap();

        let first = s.try_next(0).unwrap().unwrap();
        assert_eq!(first.job.attempts, 1);
        let outcome = s.fail(&id, FailureKind::Encode, "exit status 1").unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { attempt: 2, .. }));
        assert_eq!(s.store().get(&id).unwrap().state, JobState::Pending);

        let second = s.try_next(1).unwrap().unwrap();
        assert_eq!(second.job.id, id);
        assert_eq!(second.job.attempts, 2);
        assert_eq!(
            s.fail(&id, FailureKind::Encode, "exit status 1").unwrap(),
            FailOutcome::Exhausted
        );

        let job = s.store().get(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.is_terminal());
        assert!(s.try_next(0).unwrap().is_none());

        let states: Vec<_> = job.history.iter().map(|e| e.to).collect();
        assert_eq!(
            states,
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Failed,
                JobState::Pending,
                JobState::Running,
                JobState::Failed,
            ]
        );
    }

    #[test]
    fn test_backoff_delays_retry() {
        let s = scheduler(10, 3, 60_000);
        let id = enqueue(&s, "/m/a.mkv").unwrap();
        s.try_next(0).unwrap().unwrap();
        s.fail(&id, FailureKind::Timeout, "deadline exceeded").unwrap();

        assert!(s.try_next(0).unwrap().is_none());
        let status = s.queue_status();
        assert_eq!(status.pending, 1);
        assert_eq!(status.ready, 0);
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(5), Duration::from_secs(60));
        assert_eq!(policy.delay(100), Duration::from_secs(60));
    }

    #[test]
    fn test_cancel_pending_job_never_starts() {
        let s = scheduler(10, 3, 0);
        let id = enqueue(&s, "/m/a.mkv").unwrap();

        assert_eq!(s.cancel(&id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(s.store().get(&id).unwrap().state, JobState::Cancelled);
        assert!(s.try_next(0).unwrap().is_none());

        assert!(matches!(
            s.cancel(&id),
            Err(JobControlError::NotCancellable {
                state: JobState::Cancelled,
                ..
            })
        ));
    }

    #[test]
    fn test_cancel_running_job_signals_worker() {
        let s = scheduler(10, 3, 0);
        let id = enqueue(&s, "/m/a.mkv").unwrap();
        let claimed = s.try_next(0).unwrap().unwrap();

        assert_eq!(s.cancel(&id).unwrap(), CancelOutcome::Requested);
        assert!(claimed.cancel.is_cancelled());
        assert_eq!(s.store().get(&id).unwrap().state, JobState::Running);

        s.mark_cancelled(&id, "cancelled by request").unwrap();
        assert_eq!(s.store().get(&id).unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn test_complete_after_cancel_request_cancels() {
        let s = scheduler(10, 3, 0);
        let id = enqueue(&s, "/m/a.mkv").unwrap();
        s.try_next(0).unwrap().unwrap();

        assert_eq!(s.cancel(&id).unwrap(), CancelOutcome::Requested);
        let job = s.complete(&id, Some(100), Some(60), false).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(!job.history.iter().any(|e| e.to == JobState::Completed));

        // Once completed, a late cancel is refused
        let other = enqueue(&s, "/m/b.mkv").unwrap();
        s.try_next(0).unwrap().unwrap();
        let job = s.complete(&other, Some(100), Some(60), false).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(matches!(
            s.cancel(&other),
            Err(JobControlError::NotCancellable { .. })
        ));
    }

    #[test]
    fn test_reconcile_recovers_running_jobs_first() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());

        // Simulate a crash: a job left running by a previous process
        let crashed = store.create(Job::new(sample_plan("/m/old.mkv"), 3, false)).unwrap();
        store
            .update(&crashed, JobState::Pending, JobUpdate::Claim { worker: 7 })
            .unwrap();

        let s = Scheduler::new(Arc::clone(&store), config(10, 3, 0));
        let report = s.reconcile().unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.queued, 1);
        assert_eq!(store.get(&crashed).unwrap().state, JobState::Pending);

        enqueue(&s, "/m/new.mkv").unwrap();
        let first = s.try_next(0).unwrap().unwrap();
        assert_eq!(first.job.id, crashed);
        assert_eq!(first.job.attempts, 1);
    }

    #[test]
    fn test_repeated_crashes_fail_the_job() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = store.create(Job::new(sample_plan("/m/crashy.mkv"), 3, false)).unwrap();

        // Every restart finds the job running again
        for restart in 0..=MAX_CRASH_RECOVERIES {
            store
                .update(&id, JobState::Pending, JobUpdate::Claim { worker: 0 })
                .unwrap();
            let s = Scheduler::new(Arc::clone(&store), config(10, 3, 0));
            let report = s.reconcile().unwrap();
            if restart < MAX_CRASH_RECOVERIES {
                assert_eq!(report.recovered, 1);
                assert_eq!(store.get(&id).unwrap().state, JobState::Pending);
            } else {
                assert_eq!(report.abandoned, 1);
                assert_eq!(report.queued, 0);
            }
        }

        let job = store.get(&id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.failure(), Some(FailureKind::Interrupted));
        assert!(job.is_terminal());

        // A later restart leaves it alone
        let s = Scheduler::new(Arc::clone(&store), config(10, 3, 0));
        let report = s.reconcile().unwrap();
        assert_eq!(report.requeued, 0);
        assert!(s.try_next(0).unwrap().is_none());
    }

    #[test]
    fn test_reconcile_requeues_retryable_failures() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = store.create(Job::new(sample_plan("/m/a.mkv"), 3, false)).unwrap();
        store
            .update(&id, JobState::Pending, JobUpdate::Claim { worker: 0 })
            .unwrap();
        store
            .update(
                &id,
                JobState::Running,
                JobUpdate::Fail {
                    kind: FailureKind::Encode,
                    error: "boom".into(),
                },
            )
            .unwrap();

        let s = Scheduler::new(Arc::clone(&store), config(10, 3, 0));
        let report = s.reconcile().unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(s.try_next(0).unwrap().unwrap().job.id, id);
    }

    #[test]
    fn test_reprocess_creates_fresh_job() {
        let s = scheduler(10, 3, 0);
        let id = enqueue(&s, "/m/a.mkv").unwrap();
        assert!(matches!(
            s.reprocess(&id),
            Err(JobControlError::NotReprocessable { .. })
        ));

        s.try_next(0).unwrap().unwrap();
        s.complete(&id, Some(100), Some(60), false).unwrap();

        let fresh = s.reprocess(&id).unwrap();
        assert_ne!(fresh, id);
        let job = s.store().get(&fresh).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(s.store().get(&id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_next_wakes_on_enqueue() {
        let s = Arc::new(Scheduler::new(
            Arc::new(MemoryJobStore::new()),
            SchedulerConfig {
                poll_interval: Duration::from_secs(30),
                ..config(10, 3, 0)
            },
        ));

        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.next(0).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = enqueue(&s, "/m/a.mkv").unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("next should wake before the poll interval")
            .unwrap()
            .unwrap()
            .expect("job should be claimed");
        assert_eq!(claimed.job.id, id);
    }

    #[tokio::test]
    async fn test_next_returns_none_after_poll_interval() {
        let s = scheduler(10, 3, 0);
        let result = tokio::time::timeout(Duration::from_secs(5), s.next(0))
            .await
            .expect("bounded wait");
        assert!(result.unwrap().is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_backoff_is_monotonic_and_capped(
            base_ms in 0u64..10_000,
            max_ms in 0u64..600_000,
            attempts in 1u32..64,
        ) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
            };
            prop_assert!(policy.delay(attempts) <= policy.max);
            prop_assert!(policy.delay(attempts) <= policy.delay(attempts + 1));
        }

        /// K pending jobs and N claims give min(K, N) distinct jobs.
        #[test]
        fn prop_claims_are_unique(pending in 0usize..12, claims in 0usize..16) {
            let s = scheduler(64, 3, 0);
            for i in 0..pending {
                enqueue(&s, &format!("/m/{}.mkv", i)).unwrap();
            }
            let claimed: Vec<_> = (0..claims)
                .filter_map(|w| s.try_next(w).unwrap())
                .map(|c| c.job.id)
                .collect();
            let unique: HashSet<_> = claimed.iter().collect();
            prop_assert_eq!(claimed.len(), pending.min(claims));
            prop_assert_eq!(unique.len(), claimed.len());
        }
    }
}
