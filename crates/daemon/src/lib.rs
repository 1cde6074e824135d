//! RecodeX daemon
//!
//! Decides which media files need transcoding, turns those decisions into
//! durable jobs and runs them on a bounded worker pool that drives ffmpeg.

pub mod codec;
pub mod concurrency;
pub mod daemon;
pub mod decision;
pub mod encode;
pub mod intake;
pub mod job;
pub mod probe;
pub mod profile;
pub mod scan;
pub mod scheduler;
pub mod startup;
pub mod stats;
pub mod stats_server;
pub mod store;
pub mod worker;

pub use recodex_config as config;
pub use recodex_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError, ScanSummary};
pub use decision::{decide, Decision, EncodePlan, MatchPolicy, SkipReason, StreamAction};
pub use encode::{EncodeError, EncoderBackend, FfmpegEncoder};
pub use intake::{FileEvent, Intake, IntakeError, SubmitOutcome};
pub use job::{FailureKind, Job, JobId, JobResult, JobState, JobUpdate};
pub use probe::{probe_file, FfprobeProber, MediaProbe, MediaProber, ProbeError};
pub use profile::{EncodeProfile, HwAccel, ProfileError, ProfileResolver, ResolvedProfile};
pub use scheduler::{AdmissionError, JobControlError, QueueStatus, Scheduler, SchedulerConfig};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, StartupReport};
pub use stats::{compute_stats, CodecStats, ProfileStats, SpaceSaver, StatsAggregator, StatsSnapshot};
pub use stats_server::{create_router, run_stats_server, ApiState, ServerError};
pub use store::{FileJobStore, JobFilter, JobStore, MemoryJobStore, StoreError};
pub use worker::{JobOutcome, WorkerPool};
