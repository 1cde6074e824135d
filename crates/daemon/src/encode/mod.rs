//! External encoder integration.
//!
//! [`EncoderBackend`] is the seam between the worker pool and the external
//! encoder. [`FfmpegEncoder`] is the production backend; tests substitute
//! scripted backends.

pub mod ffmpeg;
pub mod process;
pub mod progress;

pub use ffmpeg::{build_ffmpeg_command, temp_output_path, video_encoder_name, FfmpegEncoder};
pub use process::{run_process, ProcessOutput};
pub use progress::{parse_progress_line, ProgressTracker};

use crate::decision::EncodePlan;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder exited with non-zero status
    #[error("encoder failed with exit code {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    /// Encoder was terminated by a signal
    #[error("encoder was terminated by signal: {stderr}")]
    Terminated { stderr: String },

    /// Encoder ran past its deadline and was killed
    #[error("encoder exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// Cancellation was requested and the encoder was killed
    #[error("encode cancelled")]
    Cancelled,

    /// Encoder could not be started
    #[error("failed to start encoder: {0}")]
    Spawn(std::io::Error),

    /// IO error around the encode (temp files, rename)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs encode plans.
#[async_trait]
pub trait EncoderBackend: Send + Sync {
    /// Human-readable form of what `encode` would run, for logs and dry runs.
    fn describe(&self, plan: &EncodePlan) -> String {
        format!(
            "encode {} -> {}",
            plan.source.display(),
            plan.output.display()
        )
    }

    /// Run the encode for `plan`, writing `plan.output`.
    ///
    /// Progress percentages are sent best-effort on `progress`. When `cancel`
    /// fires the encoder is stopped and [`EncodeError::Cancelled`] returned.
    async fn encode(
        &self,
        plan: &EncodePlan,
        progress: mpsc::Sender<f32>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError>;

    /// Sanity-check an output file, returning its size in bytes.
    async fn validate_output(&self, path: &Path) -> Result<u64, String>;
}
