//! Media probing via ffprobe.
//!
//! Produces the read-only [`MediaProbe`] facts the decision engine works on.

use crate::codec::canonical_container;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or rejected the file.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a video stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoStream {
    /// Codec name (e.g., "hevc", "h264", "av1").
    pub codec_name: String,
    /// Video width in pixels.
    pub width: u32,
    /// Video height in pixels.
    pub height: u32,
    /// Bitrate in bits per second (if reported).
    pub bitrate_bps: Option<u64>,
}

/// Information about an audio stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioStream {
    /// Codec name (e.g., "aac", "opus", "dts").
    pub codec_name: String,
    /// Number of audio channels.
    pub channels: u32,
}

/// Container-level information.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatInfo {
    /// ffprobe demuxer name, e.g. "matroska,webm".
    pub format_name: String,
    /// Duration in seconds.
    pub duration_secs: f64,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Overall bitrate in bits per second.
    pub bitrate_bps: Option<u64>,
}

/// Facts about a candidate file. Never mutated after probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaProbe {
    pub video_streams: Vec<VideoStream>,
    pub audio_streams: Vec<AudioStream>,
    /// Number of subtitle streams.
    pub subtitle_streams: usize,
    pub format: FormatInfo,
}

impl MediaProbe {
    /// Codec of the first video stream.
    pub fn video_codec(&self) -> Option<&str> {
        self.video_streams.first().map(|v| v.codec_name.as_str())
    }

    /// Codecs of all audio streams, in stream order.
    pub fn audio_codecs(&self) -> Vec<&str> {
        self.audio_streams
            .iter()
            .map(|a| a.codec_name.as_str())
            .collect()
    }

    /// Resolution of the first video stream.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.video_streams.first().map(|v| (v.width, v.height))
    }

    /// Canonical container name.
    pub fn container(&self) -> String {
        canonical_container(&self.format.format_name)
    }

    /// Video bitrate, falling back to the container's overall bitrate.
    pub fn video_bitrate_bps(&self) -> Option<u64> {
        self.video_streams
            .first()
            .and_then(|v| v.bitrate_bps)
            .or(self.format.bitrate_bps)
    }
}

/// Outcome of probing a file, as consumed by the decision engine.
pub type ProbeOutcome = Result<MediaProbe, ProbeError>;

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub channels: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub size: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Probes a media file with ffprobe.
///
/// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
/// and parses the JSON output.
pub async fn probe_file(path: &Path) -> ProbeOutcome {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

/// Parses ffprobe JSON output into a MediaProbe.
pub fn parse_ffprobe_output(json_str: &str) -> ProbeOutcome {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video_streams = Vec::new();
    let mut audio_streams = Vec::new();
    let mut subtitle_streams = 0;

    for stream in streams {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");
        let codec_name = stream.codec_name.clone().unwrap_or_default();

        match codec_type {
            "video" => {
                // Cover art shows up as an mjpeg/png "video" stream
                if matches!(codec_name.as_str(), "mjpeg" | "png") {
                    continue;
                }
                video_streams.push(VideoStream {
                    codec_name,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    bitrate_bps: parse_u64(stream.bit_rate.as_deref()),
                });
            }
            "audio" => {
                audio_streams.push(AudioStream {
                    codec_name,
                    channels: stream.channels.unwrap_or(0),
                });
            }
            "subtitle" => subtitle_streams += 1,
            _ => {}
        }
    }

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaProbe {
        video_streams,
        audio_streams,
        subtitle_streams,
        format: FormatInfo {
            format_name: format.format_name.unwrap_or_default(),
            duration_secs,
            size_bytes: parse_u64(format.size.as_deref()).unwrap_or(0),
            bitrate_bps: parse_u64(format.bit_rate.as_deref()),
        },
    })
}

fn parse_u64(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

/// Source of [`MediaProbe`]s for candidate files.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> ProbeOutcome;
}

/// [`MediaProber`] backed by the `ffprobe` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfprobeProber;

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> ProbeOutcome {
        probe_file(path).await
    }
}
