//! Daemon startup and main loop
//!
//! Wires configuration, profile resolution, the job store, the scheduler,
//! the worker pool and the HTTP API together, and feeds files from the
//! watch folders into the pipeline.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::decision::MatchPolicy;
use crate::encode::{EncoderBackend, FfmpegEncoder};
use crate::intake::{FileEvent, Intake, IntakeError, SubmitOutcome};
use crate::job::Job;
use crate::probe::{FfprobeProber, MediaProber};
use crate::profile::{HwAccel, ProfileResolver};
use crate::scan::scan_watch_folder;
use crate::scheduler::{AdmissionError, ReconcileReport, Scheduler, SchedulerConfig};
use crate::startup::{run_startup_checks, StartupError};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::stats_server::{run_stats_server, ApiState, ServerError};
use crate::store::{FileJobStore, JobStore, StoreError};
use crate::worker::WorkerPool;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest interval between retries of deferred monitor events.
const MIN_DEFERRED_RETRY: Duration = Duration::from_millis(10);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result of scanning the watch folders once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub queued: usize,
    pub skipped: usize,
    /// Held back because the queue was full; retried from [`Daemon::run`].
    pub deferred: usize,
    /// Duplicates and other errors.
    pub rejected: usize,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    scheduler: Arc<Scheduler>,
    intake: Arc<Intake>,
    stats: StatsAggregator,
    pool: WorkerPool,
    /// Monitor events refused with `QueueFull`, oldest first.
    deferred: Mutex<Vec<FileEvent>>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the config (with environment overrides), runs the startup
    /// checks and opens the job store in `worker.state_dir`.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        let report = tokio::task::spawn_blocking(run_startup_checks).await??;

        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.worker.state_dir)?);
        let backend = Arc::new(ffmpeg_backend(&config));
        Ok(Self::with_components(
            config,
            store,
            backend,
            Arc::new(FfprobeProber),
            report.hw_accel,
        ))
    }

    /// Assemble a daemon from explicit parts without running startup checks
    ///
    /// Useful for tests and for one-shot runs with an in-memory store.
    pub fn with_components(
        config: Config,
        store: Arc<dyn JobStore>,
        backend: Arc<dyn EncoderBackend>,
        prober: Arc<dyn MediaProber>,
        hw_accel: HwAccel,
    ) -> Self {
        let concurrency_plan = derive_plan(&config.worker);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            SchedulerConfig::from(&config.worker),
        ));
        let intake = Arc::new(Intake::new(
            Arc::new(ProfileResolver::from_config(&config, hw_accel)),
            MatchPolicy::from(&config.matching),
            prober,
            Arc::clone(&scheduler),
            config.watch_folders.clone(),
        ));
        let pool = WorkerPool::new(
            Arc::clone(&scheduler),
            backend,
            concurrency_plan,
            config.worker.dry_run,
        );

        Self {
            concurrency_plan,
            scheduler,
            intake,
            stats: StatsAggregator::new(store),
            pool,
            deferred: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.scheduler.store()
    }

    pub fn stats(&self) -> Result<StatsSnapshot, DaemonError> {
        Ok(self.stats.snapshot()?)
    }

    /// Token that stops [`Daemon::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            scheduler: Arc::clone(&self.scheduler),
            intake: Arc::clone(&self.intake),
            stats: self.stats.clone(),
        }
    }

    /// Reconcile the queue and start the workers.
    pub fn start(&self) -> Result<ReconcileReport, DaemonError> {
        let report = self.pool.start()?;
        if report.recovered > 0 {
            warn!(recovered = report.recovered, "Recovered interrupted jobs");
        }
        Ok(report)
    }

    /// Manually enqueue `path` with `profile`.
    pub async fn submit(
        &self,
        path: &Path,
        profile: &str,
        output_dir: Option<&Path>,
        dry_run: bool,
    ) -> Result<SubmitOutcome, DaemonError> {
        Ok(self.intake.submit(path, profile, output_dir, dry_run).await?)
    }

    /// Feed one file-monitor event into the pipeline.
    pub async fn handle_file_event(&self, event: FileEvent) -> Result<SubmitOutcome, DaemonError> {
        Ok(self.intake.handle_file_event(event).await?)
    }

    /// Enumerate files already present in the watch folders and feed them
    /// through [`Daemon::handle_file_event`].
    ///
    /// Files refused because the queue is full are kept and retried by
    /// [`Daemon::retry_deferred`].
    pub async fn scan_watch_folders(&self) -> ScanSummary {
        let mut summary = ScanSummary::default();
        let mut deferred = Vec::new();

        for folder in &self.config.watch_folders {
            let candidates = scan_watch_folder(folder);
            info!(
                path = %folder.path.display(),
                files = candidates.len(),
                "Scanned watch folder"
            );

            for candidate in candidates {
                summary.scanned += 1;
                let stable_since = candidate
                    .modified_time
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                let event = FileEvent {
                    path: candidate.path,
                    stable_since,
                };
                if !deferred.is_empty() {
                    // Queue already full this pass
                    summary.deferred += 1;
                    deferred.push(event);
                    continue;
                }
                self.feed(event, &mut summary, &mut deferred).await;
            }
        }
        self.defer(deferred);

        info!(
            scanned = summary.scanned,
            queued = summary.queued,
            skipped = summary.skipped,
            deferred = summary.deferred,
            rejected = summary.rejected,
            "Watch folder scan finished"
        );
        summary
    }

    /// Re-submit monitor events that were refused with `QueueFull`.
    ///
    /// Stops at the first event the queue still refuses; the rest stay
    /// deferred in order.
    pub async fn retry_deferred(&self) -> ScanSummary {
        let events = std::mem::take(&mut *self.lock_deferred());
        let mut summary = ScanSummary::default();
        if events.is_empty() {
            return summary;
        }

        let mut deferred = Vec::new();
        for event in events {
            summary.scanned += 1;
            if !deferred.is_empty() {
                summary.deferred += 1;
                deferred.push(event);
                continue;
            }
            self.feed(event, &mut summary, &mut deferred).await;
        }
        self.defer(deferred);

        if summary.queued > 0 {
            info!(
                queued = summary.queued,
                deferred = summary.deferred,
                "Deferred files queued"
            );
        }
        summary
    }

    /// Number of monitor events waiting for queue space.
    pub fn deferred_count(&self) -> usize {
        self.lock_deferred().len()
    }

    async fn feed(&self, event: FileEvent, summary: &mut ScanSummary, deferred: &mut Vec<FileEvent>) {
        let path = event.path.clone();
        match self.intake.handle_file_event(event.clone()).await {
            Ok(SubmitOutcome::Queued { .. }) => summary.queued += 1,
            Ok(SubmitOutcome::Skipped { .. }) => summary.skipped += 1,
            Err(IntakeError::Admission(AdmissionError::QueueFull { capacity })) => {
                debug!(path = %path.display(), capacity, "Queue full, deferring file");
                summary.deferred += 1;
                deferred.push(event);
            }
            Err(IntakeError::Admission(AdmissionError::Duplicate { existing, .. })) => {
                debug!(path = %path.display(), job_id = %existing, "Already queued");
                summary.rejected += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "File not queued");
                summary.rejected += 1;
            }
        }
    }

    /// Append to the deferred list, keeping one entry per path.
    fn defer(&self, events: Vec<FileEvent>) {
        let mut deferred = self.lock_deferred();
        for event in events {
            if !deferred.iter().any(|e| e.path == event.path) {
                deferred.push(event);
            }
        }
    }

    fn lock_deferred(&self) -> MutexGuard<'_, Vec<FileEvent>> {
        self.deferred.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run the daemon until Ctrl-C or the shutdown token fires
    ///
    /// Starts the workers, scans the watch folders, serves the HTTP API when
    /// enabled and keeps retrying files the full queue refused. On the way
    /// out it stops the workers and hands running jobs back to the queue.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.start()?;
        info!(
            workers = self.concurrency_plan.workers,
            hardware_slots = self.concurrency_plan.hardware_slots,
            cores = self.concurrency_plan.total_cores,
            "Daemon started"
        );

        let server = if self.config.server.enabled {
            let bind = self.config.server.bind.clone();
            let state = self.api_state();
            let token = self.shutdown.child_token();
            Some(tokio::spawn(async move {
                run_stats_server(&bind, state, token).await
            }))
        } else {
            None
        };

        self.scan_watch_folders().await;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut retry = tokio::time::interval(
            self.scheduler.config().poll_interval.max(MIN_DEFERRED_RETRY),
        );
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    if let Err(e) = result {
                        error!(error = %e, "Failed to listen for Ctrl-C");
                    }
                    info!("Shutdown requested");
                    break;
                }
                _ = self.shutdown.cancelled() => break,
                _ = retry.tick() => {
                    if self.deferred_count() > 0 {
                        self.retry_deferred().await;
                    }
                }
            }
        }

        self.shutdown().await;
        if let Some(server) = server {
            server.await??;
        }
        Ok(())
    }

    /// Stop the workers and the HTTP server.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }

    /// Wait until the job is no longer pending or running.
    pub async fn wait_for_job(&self, id: &str) -> Result<Job, DaemonError> {
        let poll = self.scheduler.config().poll_interval.min(Duration::from_millis(250));
        loop {
            let job = self.store().get(id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// The ffmpeg backend configured from `worker.temp_dir` and `worker.job_timeout_secs`.
pub fn ffmpeg_backend(config: &Config) -> FfmpegEncoder {
    let timeout = match config.worker.job_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    FfmpegEncoder::new(config.worker.temp_dir.clone(), timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::tests::{media, TableProber};
    use crate::job::JobState;
    use crate::store::{JobFilter, MemoryJobStore};
    use crate::worker::tests::{ScriptedEncoder, Step};
    use tempfile::TempDir;

    fn test_config(watch: &Path) -> Config {
        let mut config = Config::parse_toml(&format!(
            r#"
[[watch_folders]]
path = "{}"
profile = "balanced"

[worker]
max_workers = 2
retry_backoff_ms = 0
retry_backoff_max_ms = 0
poll_interval_ms = 20

[server]
enabled = false
"#,
            watch.display()
        ))
        .unwrap();
        config.worker.state_dir = watch.join(".state");
        config
    }

    fn test_daemon(config: Config, prober: TableProber) -> Daemon {
        Daemon::with_components(
            config,
            Arc::new(MemoryJobStore::new()),
            Arc::new(ScriptedEncoder::always(Step::Succeed { bytes: 10 })),
            Arc::new(prober),
            HwAccel::None,
        )
    }

    #[tokio::test]
    async fn test_scan_queues_new_files() {
        let tmp = TempDir::new().unwrap();
        let hevc = tmp.path().join("a.mkv");
        let done = tmp.path().join("b.mp4");
        std::fs::write(&hevc, b"a").unwrap();
        std::fs::write(&done, b"b").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"c").unwrap();

        let prober = TableProber::default()
            .with(hevc.clone(), media("hevc", "opus", "matroska"))
            .with(done.clone(), media("h264", "aac", "mov,mp4,m4a"));
        let daemon = test_daemon(test_config(tmp.path()), prober);

        let summary = daemon.scan_watch_folders().await;
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.skipped, 1);

        // A second scan finds the job already queued
        let summary = daemon.scan_watch_folders().await;
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.rejected, 1);
    }

    fn hevc_files(dir: &Path, count: usize) -> TableProber {
        let mut prober = TableProber::default();
        for i in 0..count {
            let path = dir.join(format!("{}.mkv", i));
            std::fs::write(&path, b"x").unwrap();
            prober = prober.with(path, media("hevc", "opus", "matroska"));
        }
        prober
    }

    #[tokio::test]
    async fn test_full_queue_defers_scanned_files() {
        let tmp = TempDir::new().unwrap();
        let prober = hevc_files(tmp.path(), 3);
        let mut config = test_config(tmp.path());
        config.worker.queue_capacity = 1;
        let daemon = test_daemon(config, prober);

        let summary = daemon.scan_watch_folders().await;
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.deferred, 2);
        assert_eq!(summary.rejected, 0);
        assert_eq!(daemon.deferred_count(), 2);

        // Still full: nothing is lost
        let retry = daemon.retry_deferred().await;
        assert_eq!(retry.queued, 0);
        assert_eq!(daemon.deferred_count(), 2);

        // Rescanning does not duplicate deferred entries
        daemon.scan_watch_folders().await;
        assert_eq!(daemon.deferred_count(), 2);
    }

    #[tokio::test]
    async fn test_run_queues_deferred_files_as_queue_drains() {
        let tmp = TempDir::new().unwrap();
        let prober = hevc_files(tmp.path(), 3);
        let mut config = test_config(tmp.path());
        config.worker.queue_capacity = 1;
        config.worker.max_workers = 1;
        let daemon = Arc::new(test_daemon(config, prober));

        let runner = {
            let daemon = Arc::clone(&daemon);
            tokio::spawn(async move { daemon.run().await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let jobs = daemon.store().list(&JobFilter::all()).unwrap();
            if jobs.len() == 3 && jobs.iter().all(|j| j.state == JobState::Completed) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} of 3 files became jobs",
                jobs.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(daemon.deferred_count(), 0);

        daemon.shutdown_token().cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("a.mkv");
        let prober =
            TableProber::default().with(source.clone(), media("hevc", "opus", "matroska"));
        let daemon = test_daemon(test_config(tmp.path()), prober);
        daemon.start().unwrap();

        let outcome = daemon
            .submit(&source, "balanced", None, false)
            .await
            .unwrap();
        let SubmitOutcome::Queued { job_id } = outcome else {
            panic!("expected a queued job, got {:?}", outcome);
        };

        let job = tokio::time::timeout(Duration::from_secs(5), daemon.wait_for_job(&job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(daemon.stats().unwrap().completed, 1);
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_profile_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let daemon = test_daemon(test_config(tmp.path()), TableProber::default());
        let err = daemon
            .submit(&tmp.path().join("a.mkv"), "missing", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Intake(IntakeError::Profile(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_token() {
        let tmp = TempDir::new().unwrap();
        let daemon = Arc::new(test_daemon(test_config(tmp.path()), TableProber::default()));
        let token = daemon.shutdown_token();

        let runner = {
            let daemon = Arc::clone(&daemon);
            tokio::spawn(async move { daemon.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_ffmpeg_backend_timeout() {
        let mut config = Config::parse_toml("").unwrap();
        assert_eq!(ffmpeg_backend(&config).timeout, None);
        config.worker.job_timeout_secs = 90;
        assert_eq!(ffmpeg_backend(&config).timeout, Some(Duration::from_secs(90)));
    }
}
