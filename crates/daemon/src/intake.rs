//! Intake: from a file path to a queued job.
//!
//! Resolves the profile, probes the file, runs the decision engine and
//! hands the decision to the scheduler. A missing profile fails before
//! anything is probed or queued.

use crate::decision::{decide, Decision, MatchPolicy, SkipReason};
use crate::job::JobId;
use crate::probe::MediaProber;
use crate::profile::{ProfileError, ProfileResolver};
use crate::scan::is_candidate;
use crate::scheduler::{AdmissionError, Scheduler};
use recodex_config::WatchFolderConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// A file reported by the monitor as fully written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    /// Unix timestamp (milliseconds) since which the file has not changed.
    pub stable_since: i64,
}

/// What happened to a submitted file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Queued { job_id: JobId },
    Skipped { reason: String },
}

/// Intake failures. None of them create a job.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("{} is not in a watch folder", .0.display())]
    NotWatched(PathBuf),
}

/// Everything needed to turn a path into a job.
pub struct Intake {
    resolver: Arc<ProfileResolver>,
    policy: MatchPolicy,
    prober: Arc<dyn MediaProber>,
    scheduler: Arc<Scheduler>,
    watch_folders: Vec<WatchFolderConfig>,
}

impl Intake {
    pub fn new(
        resolver: Arc<ProfileResolver>,
        policy: MatchPolicy,
        prober: Arc<dyn MediaProber>,
        scheduler: Arc<Scheduler>,
        watch_folders: Vec<WatchFolderConfig>,
    ) -> Self {
        Self {
            resolver,
            policy,
            prober,
            scheduler,
            watch_folders,
        }
    }

    pub fn resolver(&self) -> &ProfileResolver {
        &self.resolver
    }

    pub fn watch_folders(&self) -> &[WatchFolderConfig] {
        &self.watch_folders
    }

    /// The most specific watch folder accepting `path`.
    pub fn watch_folder_for(&self, path: &Path) -> Option<&WatchFolderConfig> {
        self.watch_folders
            .iter()
            .filter(|folder| is_candidate(folder, path))
            .max_by_key(|folder| folder.path.components().count())
    }

    /// Probe and decide `path` against `profile`, without queueing.
    pub async fn evaluate(
        &self,
        path: &Path,
        profile: &str,
        output_dir: Option<&Path>,
    ) -> Result<Decision, IntakeError> {
        let target = self
            .resolver
            .resolve(profile)?
            .with_output_dir(output_dir.map(Path::to_path_buf));
        let probe = self.prober.probe(path).await;
        Ok(decide(path, &probe, &target, &self.policy))
    }

    /// Manual enqueue of `path` with `profile`.
    ///
    /// A skip decision is an outcome, not an error.
    pub async fn submit(
        &self,
        path: &Path,
        profile: &str,
        output_dir: Option<&Path>,
        dry_run: bool,
    ) -> Result<SubmitOutcome, IntakeError> {
        let decision = self.evaluate(path, profile, output_dir).await?;
        self.admit(path, decision, dry_run)
    }

    /// Entry point for the file monitor.
    ///
    /// Files whose output already exists are skipped, so rescanning a folder
    /// does not redo finished work.
    pub async fn handle_file_event(&self, event: FileEvent) -> Result<SubmitOutcome, IntakeError> {
        let folder = self
            .watch_folder_for(&event.path)
            .ok_or_else(|| IntakeError::NotWatched(event.path.clone()))?;
        debug!(
            path = %event.path.display(),
            stable_since = event.stable_since,
            profile = %folder.profile,
            "File event"
        );

        let decision = self
            .evaluate(&event.path, &folder.profile, folder.output_path.as_deref())
            .await?;
        let decision = match decision {
            Decision::Transcode(plan) if plan.output.exists() => {
                Decision::Skip(SkipReason::OutputExists(plan.output))
            }
            other => other,
        };
        self.admit(&event.path, decision, false)
    }

    fn admit(
        &self,
        path: &Path,
        decision: Decision,
        dry_run: bool,
    ) -> Result<SubmitOutcome, IntakeError> {
        match self.scheduler.enqueue(path, decision, dry_run) {
            Ok(job_id) => Ok(SubmitOutcome::Queued { job_id }),
            Err(AdmissionError::Skipped(reason)) => {
                info!(path = %path.display(), reason = %reason, "File skipped");
                Ok(SubmitOutcome::Skipped {
                    reason: reason.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
