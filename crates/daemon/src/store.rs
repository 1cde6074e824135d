//! Job store.
//!
//! The store owns job state. Callers never hold a `&mut Job`; they ask for a
//! [`JobUpdate`] to be applied under compare-and-swap on the state they
//! expect, and the store applies it atomically per job.

use crate::job::{current_timestamp_ms, InvalidTransition, Job, JobId, JobState, JobUpdate};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    /// Compare-and-swap lost: the job is not in the expected state.
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobState,
        actual: JobState,
    },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Selects jobs in [`JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Only these states; all states when `None`.
    pub states: Option<Vec<JobState>>,
    /// Only jobs for this source path.
    pub source: Option<PathBuf>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn states(states: &[JobState]) -> Self {
        Self {
            states: Some(states.to_vec()),
            source: None,
        }
    }

    /// Pending or running jobs.
    pub fn active() -> Self {
        Self::states(&[JobState::Pending, JobState::Running])
    }

    /// Jobs that finished an attempt: completed, failed or cancelled.
    pub fn finished() -> Self {
        Self::states(&[JobState::Completed, JobState::Failed, JobState::Cancelled])
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&job.state) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &job.source_path != source {
                return false;
            }
        }
        true
    }
}

/// Storage contract used by the scheduler and the worker pool.
///
/// `update` must be atomic per job id and `list` must return a consistent
/// snapshot.
pub trait JobStore: Send + Sync {
    /// Insert a new job. The store assigns its admission sequence.
    fn create(&self, job: Job) -> Result<JobId, StoreError>;

    fn get(&self, id: &str) -> Result<Job, StoreError>;

    /// Apply `update` if the job is currently in `expected`.
    ///
    /// Returns the job after the update.
    fn update(&self, id: &str, expected: JobState, update: JobUpdate) -> Result<Job, StoreError>;

    /// Matching jobs in admission order.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

/// In-memory job table shared by both store implementations.
#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
}

impl JobTable {
    fn from_jobs(jobs: Vec<Job>) -> Self {
        let next_sequence = jobs.iter().map(|j| j.sequence + 1).max().unwrap_or(0);
        Self {
            jobs: jobs.into_iter().map(|j| (j.id.clone(), j)).collect(),
            next_sequence,
        }
    }

    /// Assign the sequence for a new job without inserting it.
    fn prepare_create(&mut self, mut job: Job) -> Result<Job, StoreError> {
        if self.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        job.sequence = self.next_sequence;
        self.next_sequence += 1;
        Ok(job)
    }

    /// Compute the updated job without committing it.
    fn prepare_update(
        &self,
        id: &str,
        expected: JobState,
        update: JobUpdate,
    ) -> Result<Job, StoreError> {
        let current = self
            .jobs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.state != expected {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected,
                actual: current.state,
            });
        }
        let mut next = current.clone();
        next.apply(update, current_timestamp_ms())?;
        Ok(next)
    }

    fn get(&self, id: &str) -> Result<Job, StoreError> {
        self.jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }

    fn commit(&mut self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }
}

fn lock(table: &Mutex<JobTable>) -> MutexGuard<'_, JobTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Volatile store for one-shot runs and tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, job: Job) -> Result<JobId, StoreError> {
        let mut table = lock(&self.table);
        let job = table.prepare_create(job)?;
        let id = job.id.clone();
        table.commit(job);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Job, StoreError> {
        lock(&self.table).get(id)
    }

    fn update(&self, id: &str, expected: JobState, update: JobUpdate) -> Result<Job, StoreError> {
        let mut table = lock(&self.table);
        let job = table.prepare_update(id, expected, update)?;
        table.commit(job.clone());
        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(lock(&self.table).list(filter))
    }
}

/// Store that persists every job as `<dir>/<id>.json`.
///
/// Writes happen under the table lock, before the in-memory copy changes,
/// so a failed write leaves both sides at the previous version. Progress
/// updates stay in memory.
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
    table: Mutex<JobTable>,
}

impl FileJobStore {
    /// Open the store, loading every job file found in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let jobs = load_jobs(&dir)?;
        debug!(dir = %dir.display(), count = jobs.len(), "Loaded job records");
        Ok(Self {
            dir,
            table: Mutex::new(JobTable::from_jobs(jobs)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist(&self, job: &Job) -> Result<(), StoreError> {
        save_job(job, &self.dir)
    }
}

impl JobStore for FileJobStore {
    fn create(&self, job: Job) -> Result<JobId, StoreError> {
        let mut table = lock(&self.table);
        let job = table.prepare_create(job)?;
        self.persist(&job)?;
        let id = job.id.clone();
        table.commit(job);
        Ok(id)
    }

    fn get(&self, id: &str) -> Result<Job, StoreError> {
        lock(&self.table).get(id)
    }

    fn update(&self, id: &str, expected: JobState, update: JobUpdate) -> Result<Job, StoreError> {
        let mut table = lock(&self.table);
        let is_progress = matches!(update, JobUpdate::Progress { .. });
        let job = table.prepare_update(id, expected, update)?;
        if !is_progress {
            self.persist(&job)?;
        }
        table.commit(job.clone());
        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(lock(&self.table).list(filter))
    }
}

/// Saves a job to `<state_dir>/<id>.json`.
///
/// Writes a temporary file and renames it so a crash never leaves a
/// truncated record behind.
pub fn save_job(job: &Job, state_dir: &Path) -> Result<(), StoreError> {
    let file_path = state_dir.join(format!("{}.json", job.id));
    let tmp_path = state_dir.join(format!(".{}.json.tmp", job.id));
    let json = serde_json::to_string_pretty(job)?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &file_path)?;
    Ok(())
}

/// Loads all jobs from JSON files in the state directory.
///
/// Files that fail to parse are skipped with a warning.
pub fn load_jobs(state_dir: &Path) -> Result<Vec<Job>, StoreError> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();

    for entry in fs::read_dir(state_dir)? {
        let path = entry?.path();

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_job_from_file(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
            }
        }
    }

    jobs.sort_by_key(|job| job.sequence);
    Ok(jobs)
}

fn load_job_from_file(path: &Path) -> Result<Job, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
