//! ffmpeg encoder backend.
//!
//! Builds an ffmpeg command line from an [`EncodePlan`], runs it into a
//! temporary sibling of the output and renames the result into place once
//! the encoder exits cleanly.

use super::process::run_process;
use super::progress::{parse_progress_line, ProgressTracker};
use super::{EncodeError, EncoderBackend};
use crate::decision::{EncodePlan, StreamAction};
use crate::probe::probe_file;
use crate::profile::HwAccel;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// VA-API render node used for hardware encodes.
const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// ffmpeg encoder name for a canonical video codec on the given hardware.
pub fn video_encoder_name(codec: &str, hw: HwAccel) -> String {
    let name = match (codec, hw) {
        ("h264", HwAccel::Nvenc) => "h264_nvenc",
        ("hevc", HwAccel::Nvenc) => "hevc_nvenc",
        ("h264", HwAccel::Qsv) => "h264_qsv",
        ("hevc", HwAccel::Qsv) => "hevc_qsv",
        ("h264", HwAccel::Vaapi) => "h264_vaapi",
        ("hevc", HwAccel::Vaapi) => "hevc_vaapi",
        ("h264", _) => "libx264",
        ("hevc", _) => "libx265",
        ("av1", _) => "libaom-av1",
        ("vp9", _) => "libvpx-vp9",
        (other, _) => other,
    };
    name.to_string()
}

/// ffmpeg encoder name for a canonical audio codec.
fn audio_encoder_name(codec: &str) -> &str {
    match codec {
        "opus" => "libopus",
        "mp3" => "libmp3lame",
        other => other,
    }
}

/// NVENC uses its own p1-p7 preset scale.
fn nvenc_preset(preset: &str) -> &'static str {
    match preset {
        "ultrafast" => "p1",
        "superfast" => "p2",
        "veryfast" => "p3",
        "faster" => "p4",
        "fast" => "p5",
        "medium" => "p6",
        "slow" | "slower" | "veryslow" => "p7",
        _ => "p6",
    }
}

/// Temporary file the encoder writes before the rename: `<stem>.tmp.<ext>`.
pub fn temp_output_path(output: &Path, temp_dir: Option<&Path>) -> PathBuf {
    let dir = temp_dir
        .map(Path::to_path_buf)
        .or_else(|| output.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    match output.extension() {
        Some(ext) => dir.join(format!("{}.tmp.{}", stem, ext.to_string_lossy())),
        None => dir.join(format!("{}.tmp", stem)),
    }
}

/// Build the ffmpeg command for `plan`, writing to `output`.
pub fn build_ffmpeg_command(plan: &EncodePlan, output: &Path) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-nostdin", "-y"]);

    let video_encoder = match &plan.video {
        StreamAction::Reencode { codec } => Some(video_encoder_name(codec, plan.hw_accel)),
        _ => None,
    };
    let vaapi = video_encoder
        .as_deref()
        .map(|e| e.ends_with("_vaapi"))
        .unwrap_or(false);

    if vaapi {
        cmd.arg("-vaapi_device").arg(VAAPI_DEVICE);
    }

    cmd.arg("-i").arg(&plan.source);

    // Streams
    cmd.args(["-map", "0:v:0"]);
    if !plan.audio.is_empty() {
        cmd.args(["-map", "0:a?"]);
    }
    if !matches!(plan.subtitles, StreamAction::Drop) {
        cmd.args(["-map", "0:s?"]);
    }

    // Video
    match &video_encoder {
        None => {
            cmd.args(["-c:v", "copy"]);
        }
        Some(encoder) => {
            cmd.arg("-c:v").arg(encoder);

            if vaapi {
                cmd.args(["-vf", "format=nv12,hwupload"]);
            }

            if let Some(crf) = plan.video_crf {
                let flag = if encoder.ends_with("_vaapi") {
                    "-qp"
                } else if encoder.ends_with("_nvenc") {
                    "-cq"
                } else if encoder.ends_with("_qsv") {
                    "-global_quality"
                } else {
                    "-crf"
                };
                cmd.arg(flag).arg(crf.to_string());
            }

            match &plan.video_bitrate {
                Some(bitrate) => {
                    cmd.arg("-b:v").arg(bitrate);
                }
                // libaom needs an explicit zero bitrate for constant quality
                None if encoder == "libaom-av1" && plan.video_crf.is_some() => {
                    cmd.args(["-b:v", "0"]);
                }
                None => {}
            }

            if !plan.preset.is_empty() {
                if encoder.ends_with("_nvenc") {
                    cmd.arg("-preset").arg(nvenc_preset(&plan.preset));
                } else if matches!(encoder.as_str(), "libx264" | "libx265") {
                    cmd.arg("-preset").arg(&plan.preset);
                }
            }
        }
    }

    // Audio, per stream
    for (index, action) in plan.audio.iter().enumerate() {
        match action {
            StreamAction::Copy => {
                cmd.arg(format!("-c:a:{}", index)).arg("copy");
            }
            StreamAction::Reencode { codec } => {
                cmd.arg(format!("-c:a:{}", index))
                    .arg(audio_encoder_name(codec));
                if let Some(bitrate) = &plan.audio_bitrate {
                    cmd.arg(format!("-b:a:{}", index)).arg(bitrate);
                }
                if plan.audio_normalize {
                    cmd.arg(format!("-filter:a:{}", index)).arg("loudnorm");
                }
            }
            StreamAction::Drop => {}
        }
    }

    // Subtitles
    match plan.subtitles {
        StreamAction::Drop => {
            cmd.arg("-sn");
        }
        // mp4 cannot carry text subtitles as-is
        _ if plan.container == "mp4" => {
            cmd.args(["-c:s", "mov_text"]);
        }
        _ => {
            cmd.args(["-c:s", "copy"]);
        }
    }

    if plan.container == "mp4" {
        cmd.args(["-movflags", "+faststart"]);
    }

    cmd.args(["-progress", "pipe:2", "-nostats"]);
    cmd.arg(output);
    cmd
}

/// Render a command for logs.
fn render_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| arg.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Production encoder backend.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    /// Directory for temporary output; next to the output when unset.
    pub temp_dir: Option<PathBuf>,
    /// Deadline for a single run.
    pub timeout: Option<Duration>,
}

impl FfmpegEncoder {
    pub fn new(temp_dir: Option<PathBuf>, timeout: Option<Duration>) -> Self {
        Self { temp_dir, timeout }
    }
}

#[async_trait]
impl EncoderBackend for FfmpegEncoder {
    fn describe(&self, plan: &EncodePlan) -> String {
        let temp = temp_output_path(&plan.output, self.temp_dir.as_deref());
        render_command(&build_ffmpeg_command(plan, &temp))
    }

    async fn encode(
        &self,
        plan: &EncodePlan,
        progress: mpsc::Sender<f32>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError> {
        let temp = temp_output_path(&plan.output, self.temp_dir.as_deref());
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = plan.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cmd = build_ffmpeg_command(plan, &temp);
        debug!(command = %render_command(&cmd), "Running ffmpeg");

        let mut tracker = ProgressTracker::new(plan.duration_secs);
        let result = run_process(cmd.into(), self.timeout, cancel, |line| {
            if let Some(percent) = tracker.observe(line) {
                // Best-effort: a full channel just drops the update
                let _ = progress.try_send(percent);
            }
            parse_progress_line(line).is_some() || is_progress_field(line)
        })
        .await;

        match result {
            Ok(_) => {
                if let Err(e) = move_into_place(&temp, &plan.output).await {
                    remove_temp(&temp).await;
                    return Err(EncodeError::Io(e));
                }
                Ok(())
            }
            Err(e) => {
                remove_temp(&temp).await;
                Err(e)
            }
        }
    }

    async fn validate_output(&self, path: &Path) -> Result<u64, String> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("cannot read output {}: {}", path.display(), e))?
            .len();
        if size == 0 {
            return Err(format!("output {} is empty", path.display()));
        }

        let probe = probe_file(path)
            .await
            .map_err(|e| format!("output {} does not probe: {}", path.display(), e))?;
        if probe.video_streams.is_empty() {
            return Err(format!("output {} has no video stream", path.display()));
        }
        Ok(size)
    }
}

/// `key=value` lines of the `-progress` block.
fn is_progress_field(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => !key.is_empty() && !key.contains(char::is_whitespace),
        None => false,
    }
}

/// Move the finished temporary output to `output`.
///
/// Rename first; when that fails (`temp_dir` on another filesystem) copy to a
/// sibling of `output` and rename that into place, so `output` never holds a
/// partial file.
pub(crate) async fn move_into_place(temp: &Path, output: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(temp, output).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                from = %temp.display(),
                to = %output.display(),
                error = %e,
                "Rename failed, copying output into place"
            );
            copy_into_place(temp, output).await
        }
    }
}

async fn copy_into_place(temp: &Path, output: &Path) -> std::io::Result<()> {
    let staging = temp_output_path(output, None);
    if let Err(e) = tokio::fs::copy(temp, &staging).await {
        remove_temp(&staging).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&staging, output).await {
        remove_temp(&staging).await;
        return Err(e);
    }
    remove_temp(temp).await;
    Ok(())
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temporary output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary output"),
    }
}
