//! Job model and lifecycle state machine.
//!
//! A [`Job`] only changes through [`Job::apply`], which checks the requested
//! [`JobUpdate`] against the allowed edges of [`JobState`] and appends an
//! [`AuditEntry`] for every state change. Stores apply updates under their
//! own lock, so the checks here are what keep the lifecycle consistent.

use crate::decision::EncodePlan;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Unique job identifier (UUID v4).
pub type JobId = String;

/// Index of a worker in the pool.
pub type WorkerId = usize;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed by exactly one worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Last attempt failed; may be retried while attempts remain.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// Whether the edge `self -> next` exists in the state machine.
    ///
    /// `Failed -> Pending` additionally requires remaining attempts, which
    /// [`Job::apply`] checks.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" | "canceled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Encoder exited non-zero or was killed.
    Encode,
    /// Encoder succeeded but the output failed the sanity check.
    InvalidOutput,
    /// Encoder exceeded its deadline.
    Timeout,
    /// The daemon stopped mid-encode too many times. Never retried.
    Interrupted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Encode => write!(f, "encode"),
            FailureKind::InvalidOutput => write!(f, "invalid_output"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome recorded on a job when an attempt finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub output_path: Option<PathBuf>,
    pub bytes_before: Option<u64>,
    pub bytes_after: Option<u64>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    /// Completed without running the encoder.
    #[serde(default)]
    pub dry_run: bool,
}

/// One entry of a job's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix timestamp (milliseconds).
    pub at: i64,
    /// Previous state; `None` for creation.
    pub from: Option<JobState>,
    pub to: JobState,
    pub note: String,
}

/// A requested change to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// `pending -> running`, owned by `worker`.
    Claim { worker: WorkerId },
    /// Progress report from the owning worker. No state change.
    Progress { percent: f32 },
    /// `running -> completed`.
    Complete {
        bytes_before: Option<u64>,
        bytes_after: Option<u64>,
        dry_run: bool,
    },
    /// `running -> failed`.
    Fail { kind: FailureKind, error: String },
    /// `pending | running -> cancelled`.
    Cancel { reason: String },
    /// `failed -> pending`, claimable from `not_before` on.
    Requeue { not_before: i64 },
    /// `running -> pending` for a job whose worker is gone. `crashed` marks
    /// recovery after the process died rather than a clean shutdown.
    Recover { reason: String, crashed: bool },
}

impl JobUpdate {
    /// State the job is in after this update.
    pub fn target_state(&self) -> JobState {
        match self {
            JobUpdate::Claim { .. } | JobUpdate::Progress { .. } => JobState::Running,
            JobUpdate::Complete { .. } => JobState::Completed,
            JobUpdate::Fail { .. } => JobState::Failed,
            JobUpdate::Cancel { .. } => JobState::Cancelled,
            JobUpdate::Requeue { .. } | JobUpdate::Recover { .. } => JobState::Pending,
        }
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid transition for job {job_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub job_id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// The durable unit of work for one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub source_path: PathBuf,
    /// Profile key the plan was resolved from.
    pub profile: String,
    pub plan: EncodePlan,
    pub state: JobState,
    /// Attempts started so far.
    pub attempts: u32,
    /// Attempts allowed before a failure becomes permanent.
    pub max_attempts: u32,
    /// Worker holding the job while it is running.
    pub owner: Option<WorkerId>,
    /// Times the job was found running after a crash.
    #[serde(default)]
    pub recoveries: u32,
    #[serde(default)]
    pub dry_run: bool,
    /// Encoder progress, 0-100.
    #[serde(default)]
    pub progress: f32,
    /// Admission order, assigned by the store.
    #[serde(default)]
    pub sequence: u64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Earliest time a requeued job may be claimed again.
    pub not_before: Option<i64>,
    pub result: Option<JobResult>,
    #[serde(default)]
    pub history: Vec<AuditEntry>,
}

impl Job {
    /// Create a pending job for `plan`.
    pub fn new(plan: EncodePlan, max_attempts: u32, dry_run: bool) -> Self {
        let now = current_timestamp_ms();
        Job {
            id: Uuid::new_v4().to_string(),
            source_path: plan.source.clone(),
            profile: plan.profile.clone(),
            plan,
            state: JobState::Pending,
            attempts: 0,
            max_attempts,
            owner: None,
            recoveries: 0,
            dry_run,
            progress: 0.0,
            sequence: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            not_before: None,
            result: None,
            history: vec![AuditEntry {
                at: now,
                from: None,
                to: JobState::Pending,
                note: "created".to_string(),
            }],
        }
    }

    pub fn output_path(&self) -> &std::path::Path {
        &self.plan.output
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Failed with attempts left.
    pub fn is_retryable(&self) -> bool {
        self.state == JobState::Failed
            && self.attempts < self.max_attempts
            && self.failure() != Some(FailureKind::Interrupted)
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.result.as_ref().and_then(|r| r.failure)
    }

    /// No further transition will happen on its own.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Completed | JobState::Cancelled => true,
            JobState::Failed => !self.is_retryable(),
            JobState::Pending | JobState::Running => false,
        }
    }

    /// Wall-clock duration of the last attempt.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }

    /// Apply `update` at time `now`.
    ///
    /// On error the job is left untouched.
    pub fn apply(&mut self, update: JobUpdate, now: i64) -> Result<(), InvalidTransition> {
        let from = self.state;
        let to = update.target_state();
        let invalid = || InvalidTransition {
            job_id: self.id.clone(),
            from,
            to,
        };

        if let JobUpdate::Progress { percent } = update {
            if from != JobState::Running {
                return Err(invalid());
            }
            self.progress = percent.clamp(0.0, 100.0);
            return Ok(());
        }

        let allowed = match &update {
            JobUpdate::Claim { .. } => from == JobState::Pending,
            JobUpdate::Complete { .. } | JobUpdate::Fail { .. } => from == JobState::Running,
            JobUpdate::Cancel { .. } => from.is_active(),
            JobUpdate::Requeue { .. } => self.is_retryable(),
            JobUpdate::Recover { .. } => from == JobState::Running,
            JobUpdate::Progress { .. } => false,
        };
        if !allowed || !from.can_transition_to(to) {
            return Err(invalid());
        }

        let note = match update {
            JobUpdate::Claim { worker } => {
                self.attempts += 1;
                self.owner = Some(worker);
                self.started_at = Some(now);
                self.finished_at = None;
                self.not_before = None;
                self.progress = 0.0;
                self.result = None;
                format!("claimed by worker {} (attempt {})", worker, self.attempts)
            }
            JobUpdate::Complete {
                bytes_before,
                bytes_after,
                dry_run,
            } => {
                self.owner = None;
                self.finished_at = Some(now);
                self.progress = 100.0;
                self.result = Some(JobResult {
                    output_path: Some(self.plan.output.clone()),
                    bytes_before,
                    bytes_after,
                    error: None,
                    failure: None,
                    dry_run,
                });
                if dry_run {
                    "dry-run".to_string()
                } else {
                    "completed".to_string()
                }
            }
            JobUpdate::Fail { kind, error } => {
                self.owner = None;
                self.finished_at = Some(now);
                let note = format!("{}: {}", kind, error);
                self.result = Some(JobResult {
                    error: Some(error),
                    failure: Some(kind),
                    ..JobResult::default()
                });
                note
            }
            JobUpdate::Cancel { reason } => {
                self.owner = None;
                self.finished_at = Some(now);
                reason
            }
            JobUpdate::Requeue { not_before } => {
                self.not_before = Some(not_before);
                format!(
                    "retry {} of {} scheduled",
                    self.attempts + 1,
                    self.max_attempts
                )
            }
            JobUpdate::Recover { reason, crashed } => {
                // The interrupted attempt does not count against the retry budget
                self.attempts = self.attempts.saturating_sub(1);
                if crashed {
                    self.recoveries += 1;
                }
                self.owner = None;
                self.started_at = None;
                self.progress = 0.0;
                self.not_before = None;
                reason
            }
            JobUpdate::Progress { .. } => return Ok(()),
        };

        self.state = to;
        self.history.push(AuditEntry {
            at: now,
            from: Some(from),
            to,
            note,
        });
        Ok(())
    }
}

/// Crash recoveries after which a job still found running is failed.
pub const MAX_CRASH_RECOVERIES: u32 = 3;

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
