//! Transcode decision engine.
//!
//! [`decide`] is a pure function of the probe, the resolved profile and the
//! matching policy. It performs no I/O and returns the same [`Decision`] for
//! the same inputs, so it is safe to call concurrently, on replay and for
//! dry runs.

use crate::codec::{canonical_codec, parse_bitrate, same_codec, same_container};
use crate::probe::{MediaProbe, ProbeOutcome};
use crate::profile::{HwAccel, ResolvedProfile, SubtitleMode};
use recodex_config::MatchingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tolerance used to decide that a file already matches its profile.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPolicy {
    /// Require the container to match as well as the codecs.
    pub compare_container: bool,
    /// Compare the source bitrate against the profile's target bitrate.
    pub compare_quality: bool,
    /// Fraction above the target bitrate still counted as a match.
    pub bitrate_tolerance: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from(&MatchingConfig::default())
    }
}

impl From<&MatchingConfig> for MatchPolicy {
    fn from(cfg: &MatchingConfig) -> Self {
        Self {
            compare_container: cfg.compare_container,
            compare_quality: cfg.compare_quality,
            bitrate_tolerance: cfg.bitrate_tolerance.max(0.0),
        }
    }
}

/// What to do with one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum StreamAction {
    /// Carry the stream over without re-encoding.
    Copy,
    /// Re-encode the stream to the given canonical codec.
    Reencode { codec: String },
    /// Leave the stream out of the output.
    Drop,
}

impl StreamAction {
    pub fn is_copy(&self) -> bool {
        matches!(self, StreamAction::Copy)
    }
}

/// Concrete encode plan for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodePlan {
    pub source: PathBuf,
    pub output: PathBuf,
    /// Profile key.
    pub profile: String,
    pub container: String,
    pub video: StreamAction,
    /// One action per audio stream, in stream order.
    pub audio: Vec<StreamAction>,
    pub subtitles: StreamAction,
    pub video_crf: Option<u32>,
    pub video_bitrate: Option<String>,
    pub audio_bitrate: Option<String>,
    pub audio_normalize: bool,
    pub preset: String,
    pub hw_accel: HwAccel,
    /// Source duration, used to turn encoder timestamps into progress.
    pub duration_secs: f64,
    /// Source size in bytes at decision time.
    pub source_size: u64,
}

/// Why a file was not turned into a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum SkipReason {
    /// Codecs, container and quality already match the profile.
    AlreadyMatchesTarget,
    /// The file could not be probed.
    ProbeFailed(String),
    /// The file has no video stream to encode.
    NoVideoStream,
    /// The derived output already exists on disk.
    OutputExists(PathBuf),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyMatchesTarget => write!(f, "already matches target"),
            SkipReason::ProbeFailed(detail) => write!(f, "probe failed: {}", detail),
            SkipReason::NoVideoStream => write!(f, "no video stream"),
            SkipReason::OutputExists(path) => write!(f, "output exists: {}", path.display()),
        }
    }
}

/// Result of the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Skip(SkipReason),
    Transcode(EncodePlan),
}

impl Decision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Decision::Skip(_))
    }
}

/// Decide whether `source` needs transcoding for `target`.
///
/// Rules, first match wins:
/// 1. codecs, container and quality already match within the policy → skip
/// 2. the file could not be probed, or has no video → skip
/// 3. otherwise transcode, copying every stream whose codec already matches
pub fn decide(
    source: &Path,
    probe: &ProbeOutcome,
    target: &ResolvedProfile,
    policy: &MatchPolicy,
) -> Decision {
    let probe = match probe {
        Ok(probe) => probe,
        Err(e) => return Decision::Skip(SkipReason::ProbeFailed(e.to_string())),
    };

    if probe.video_streams.is_empty() {
        return Decision::Skip(SkipReason::NoVideoStream);
    }

    if matches_target(probe, target, policy) {
        return Decision::Skip(SkipReason::AlreadyMatchesTarget);
    }

    Decision::Transcode(build_plan(source, probe, target, policy))
}

/// Rule 1: does the probed file already satisfy the profile?
pub fn matches_target(probe: &MediaProbe, target: &ResolvedProfile, policy: &MatchPolicy) -> bool {
    let profile = &target.profile;

    let video_matches = probe
        .video_codec()
        .map(|codec| same_codec(codec, &profile.video_codec))
        .unwrap_or(false);
    if !video_matches {
        return false;
    }

    if policy.compare_container && !same_container(&probe.format.format_name, &profile.container)
    {
        return false;
    }

    if policy.compare_quality && !quality_within_tolerance(probe, target, policy) {
        return false;
    }

    if let Some(audio) = &profile.audio_codec {
        if probe
            .audio_streams
            .iter()
            .any(|stream| !same_codec(&stream.codec_name, audio))
        {
            return false;
        }
    }

    if profile.subtitles == SubtitleMode::None && probe.subtitle_streams > 0 {
        return false;
    }

    true
}

/// Bitrate check; passes when either side has no bitrate to compare.
fn quality_within_tolerance(
    probe: &MediaProbe,
    target: &ResolvedProfile,
    policy: &MatchPolicy,
) -> bool {
    let target_bps = match target.profile.video_bitrate.as_deref().and_then(parse_bitrate) {
        Some(bps) => bps,
        None => return true,
    };
    match probe.video_bitrate_bps() {
        Some(actual) => (actual as f64) <= (target_bps as f64) * (1.0 + policy.bitrate_tolerance),
        None => true,
    }
}

fn build_plan(
    source: &Path,
    probe: &MediaProbe,
    target: &ResolvedProfile,
    policy: &MatchPolicy,
) -> EncodePlan {
    let profile = &target.profile;

    // A matching codec at too high a bitrate still has to be re-encoded
    let video_codec_matches = probe
        .video_codec()
        .map(|codec| same_codec(codec, &profile.video_codec))
        .unwrap_or(false);
    let video = if video_codec_matches
        && (!policy.compare_quality || quality_within_tolerance(probe, target, policy))
    {
        StreamAction::Copy
    } else {
        StreamAction::Reencode {
            codec: profile.video_codec.clone(),
        }
    };

    let audio = probe
        .audio_streams
        .iter()
        .map(|stream| match &profile.audio_codec {
            None => StreamAction::Copy,
            Some(codec) if same_codec(&stream.codec_name, codec) => StreamAction::Copy,
            Some(codec) => StreamAction::Reencode {
                codec: canonical_codec(codec),
            },
        })
        .collect();

    let subtitles = match profile.subtitles {
        SubtitleMode::Copy => StreamAction::Copy,
        SubtitleMode::None => StreamAction::Drop,
    };

    EncodePlan {
        source: source.to_path_buf(),
        output: target.output_path_for(source),
        profile: profile.key.clone(),
        container: profile.container.clone(),
        video,
        audio,
        subtitles,
        video_crf: profile.video_crf,
        video_bitrate: profile.video_bitrate.clone(),
        audio_bitrate: profile.audio_bitrate.clone(),
        audio_normalize: profile.audio_normalize,
        preset: profile.preset.clone(),
        hw_accel: target.hw_accel,
        duration_secs: probe.format.duration_secs,
        source_size: probe.format.size_bytes,
    }
}
