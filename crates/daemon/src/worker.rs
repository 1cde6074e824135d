//! Worker pool.
//!
//! A fixed number of tokio tasks each claim one job at a time from the
//! [`Scheduler`], run it through the [`EncoderBackend`] and report the
//! outcome. Hardware-accelerated encodes additionally hold a permit from a
//! semaphore sized to the hardware slots of the [`ConcurrencyPlan`].
//!
//! No lock is held while the encoder runs; progress reaches the store
//! through a bounded channel drained by a forwarder task.

use crate::concurrency::ConcurrencyPlan;
use crate::decision::EncodePlan;
use crate::encode::{EncodeError, EncoderBackend};
use crate::job::{FailureKind, JobState, WorkerId};
use crate::scheduler::{ClaimedJob, FailOutcome, ReconcileReport, Scheduler};
use crate::store::StoreError;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the per-job progress channel
const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// How one claimed job ended for its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    DryRun,
    /// Failed and requeued with backoff.
    Retrying,
    /// Failed with no attempts left.
    Failed,
    Cancelled,
    /// Handed back to the queue because the pool is shutting down.
    Released,
    /// The store rejected the final transition.
    StoreError,
}

/// State shared by all workers of a pool.
struct WorkerContext {
    scheduler: Arc<Scheduler>,
    backend: Arc<dyn EncoderBackend>,
    hardware: Arc<Semaphore>,
    dry_run: bool,
    shutdown: CancellationToken,
}

/// Fixed-size pool of encode workers.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    plan: ConcurrencyPlan,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a pool. Nothing runs until [`WorkerPool::start`].
    ///
    /// With `dry_run` set every job is completed without running the encoder.
    pub fn new(
        scheduler: Arc<Scheduler>,
        backend: Arc<dyn EncoderBackend>,
        plan: ConcurrencyPlan,
        dry_run: bool,
    ) -> Self {
        let permits = plan.hardware_slots.max(1) as usize;
        Self {
            ctx: Arc::new(WorkerContext {
                scheduler,
                backend,
                hardware: Arc::new(Semaphore::new(permits)),
                dry_run,
                shutdown: CancellationToken::new(),
            }),
            plan,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.plan
    }

    /// Free hardware encode slots.
    pub fn available_hardware_slots(&self) -> usize {
        self.ctx.hardware.available_permits()
    }

    /// Reconcile the queue with the store, then spawn the workers.
    ///
    /// Reconciliation finishes before any worker can claim, so jobs recovered
    /// from a crash are back in the queue ahead of new work.
    pub fn start(&self) -> Result<ReconcileReport, StoreError> {
        let report = self.ctx.scheduler.reconcile()?;

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for worker in 0..self.plan.workers as WorkerId {
            let ctx = Arc::clone(&self.ctx);
            handles.push(tokio::spawn(worker_loop(ctx, worker)));
        }
        info!(
            workers = self.plan.workers,
            hardware_slots = self.plan.hardware_slots,
            dry_run = self.ctx.dry_run,
            "Worker pool started"
        );
        Ok(report)
    }

    /// Stop all workers and wait for them to exit.
    ///
    /// Running encodes are stopped and their jobs handed back to the queue.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        self.ctx.scheduler.wake_all();

        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }
}

async fn worker_loop(ctx: Arc<WorkerContext>, worker: WorkerId) {
    debug!(worker, "Worker started");
    loop {
        let claimed = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            claimed = ctx.scheduler.next(worker) => claimed,
        };

        match claimed {
            Ok(Some(claimed)) => {
                let id = claimed.job.id.clone();
                let outcome = run_job(&ctx, worker, claimed).await;
                debug!(worker, job_id = %id, outcome = ?outcome, "Worker finished job");
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker, error = %e, "Failed to claim job");
                let backoff = ctx.scheduler.config().poll_interval;
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    debug!(worker, "Worker stopped");
}

/// Why an encode stopped early.
enum Interrupt {
    Cancelled,
    Shutdown,
}

async fn run_job(ctx: &WorkerContext, worker: WorkerId, claimed: ClaimedJob) -> JobOutcome {
    let ClaimedJob { job, cancel } = claimed;
    let id = job.id.clone();
    let plan = &job.plan;
    let bytes_before = source_size(plan).await;

    if ctx.dry_run || job.dry_run {
        info!(
            job_id = %id,
            worker,
            command = %ctx.backend.describe(plan),
            "Dry run, encoder not invoked"
        );
        return match ctx.scheduler.complete(&id, bytes_before, None, true) {
            Ok(job) if job.state == JobState::Cancelled => JobOutcome::Cancelled,
            result => report(result, JobOutcome::DryRun),
        };
    }

    let _permit = if needs_hardware_slot(plan) {
        match acquire_hardware(ctx, &cancel).await {
            Ok(permit) => Some(permit),
            Err(Interrupt::Cancelled) => {
                return report(
                    ctx.scheduler.mark_cancelled(&id, "cancelled before start"),
                    JobOutcome::Cancelled,
                );
            }
            Err(Interrupt::Shutdown) => {
                return report(
                    ctx.scheduler.release(&id, "worker shut down"),
                    JobOutcome::Released,
                );
            }
        }
    } else {
        None
    };

    let (progress_tx, mut progress_rx) = mpsc::channel::<f32>(PROGRESS_CHANNEL_CAPACITY);
    let forwarder = {
        let scheduler = Arc::clone(&ctx.scheduler);
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(percent) = progress_rx.recv().await {
                debug!(job_id = %id, percent, "Encode progress");
                if let Err(e) = scheduler.report_progress(&id, percent) {
                    debug!(job_id = %id, error = %e, "Dropped progress update");
                }
            }
        })
    };

    info!(job_id = %id, worker, output = %plan.output.display(), "Encoding");
    let encode_cancel = CancellationToken::new();
    let mut encode = ctx
        .backend
        .encode(plan, progress_tx, encode_cancel.clone());

    let result = tokio::select! {
        result = &mut encode => result,
        _ = cancel.cancelled() => {
            encode_cancel.cancel();
            (&mut encode).await
        }
        _ = ctx.shutdown.cancelled() => {
            encode_cancel.cancel();
            (&mut encode).await
        }
    };
    // Drops the progress sender so the forwarder drains and exits
    drop(encode);

    if let Err(e) = forwarder.await {
        warn!(job_id = %id, error = %e, "Progress forwarder failed");
    }

    match result {
        Ok(()) => finish_encoded(ctx, &id, plan, &cancel, bytes_before).await,
        Err(EncodeError::Cancelled) if cancel.is_cancelled() => report(
            ctx.scheduler.mark_cancelled(&id, "cancelled by request"),
            JobOutcome::Cancelled,
        ),
        Err(EncodeError::Cancelled) if ctx.shutdown.is_cancelled() => report(
            ctx.scheduler.release(&id, "worker shut down"),
            JobOutcome::Released,
        ),
        Err(e @ EncodeError::Timeout(_)) => fail(ctx, &id, FailureKind::Timeout, &e.to_string()),
        Err(e) => fail(ctx, &id, FailureKind::Encode, &e.to_string()),
    }
}

/// Validate a finished encode and record the outcome.
///
/// A cancel request that lands after the encoder exited still ends the job
/// as `cancelled`, and the output is removed.
async fn finish_encoded(
    ctx: &WorkerContext,
    id: &str,
    plan: &EncodePlan,
    cancel: &CancellationToken,
    bytes_before: Option<u64>,
) -> JobOutcome {
    let validated = tokio::select! {
        validated = ctx.backend.validate_output(&plan.output) => Some(validated),
        _ = cancel.cancelled() => None,
    };

    match validated {
        None => {
            discard_output(plan).await;
            report(
                ctx.scheduler.mark_cancelled(id, "cancelled by request"),
                JobOutcome::Cancelled,
            )
        }
        Some(Ok(bytes_after)) => {
            match ctx
                .scheduler
                .complete(id, bytes_before, Some(bytes_after), false)
            {
                Ok(job) if job.state == JobState::Cancelled => {
                    discard_output(plan).await;
                    JobOutcome::Cancelled
                }
                result => report(result, JobOutcome::Completed),
            }
        }
        Some(Err(reason)) => {
            discard_output(plan).await;
            fail(ctx, id, FailureKind::InvalidOutput, &format!("invalid output: {}", reason))
        }
    }
}

fn fail(ctx: &WorkerContext, id: &str, kind: FailureKind, error: &str) -> JobOutcome {
    match ctx.scheduler.fail(id, kind, error) {
        Ok(FailOutcome::Retrying { .. }) => JobOutcome::Retrying,
        Ok(FailOutcome::Exhausted) => JobOutcome::Failed,
        Err(e) => {
            error!(job_id = %id, error = %e, "Failed to record job failure");
            JobOutcome::StoreError
        }
    }
}

fn report<T>(result: Result<T, StoreError>, outcome: JobOutcome) -> JobOutcome {
    match result {
        Ok(_) => outcome,
        Err(e) => {
            error!(error = %e, outcome = ?outcome, "Failed to record job outcome");
            JobOutcome::StoreError
        }
    }
}

fn needs_hardware_slot(plan: &EncodePlan) -> bool {
    plan.hw_accel.is_hardware() && !plan.video.is_copy()
}

async fn acquire_hardware(
    ctx: &WorkerContext,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, Interrupt> {
    tokio::select! {
        permit = Arc::clone(&ctx.hardware).acquire_owned() => {
            // The semaphore is never closed
            permit.map_err(|_| Interrupt::Shutdown)
        }
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = ctx.shutdown.cancelled() => Err(Interrupt::Shutdown),
    }
}

async fn source_size(plan: &EncodePlan) -> Option<u64> {
    if plan.source_size > 0 {
        return Some(plan.source_size);
    }
    tokio::fs::metadata(&plan.source).await.ok().map(|m| m.len())
}

async fn discard_output(plan: &EncodePlan) {
    if let Err(e) = tokio::fs::remove_file(&plan.output).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %plan.output.display(), error = %e, "Failed to remove output");
        }
    }
}
