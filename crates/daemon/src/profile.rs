//! Profile resolution.
//!
//! Turns configured profiles into immutable [`EncodeProfile`]s, resolves the
//! hardware-acceleration preference against the detected hardware, and
//! derives output paths.

use crate::codec::canonical_codec;
use recodex_config::{Config, ProfileConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Error raised when a profile cannot be resolved.
///
/// A configuration error: fatal for the file being admitted, never for the
/// process.
#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("Profile '{0}' not found")]
    NotFound(String),
}

/// Hardware encoder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HwAccel {
    /// Software encoding.
    #[default]
    None,
    /// NVIDIA NVENC.
    Nvenc,
    /// Intel Quick Sync.
    Qsv,
    /// VA-API.
    Vaapi,
}

impl HwAccel {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, HwAccel::None)
    }
}

impl std::fmt::Display for HwAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HwAccel::None => write!(f, "none"),
            HwAccel::Nvenc => write!(f, "nvenc"),
            HwAccel::Qsv => write!(f, "qsv"),
            HwAccel::Vaapi => write!(f, "vaapi"),
        }
    }
}

/// Subtitle handling requested by a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleMode {
    Copy,
    None,
}

/// A named target encode configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeProfile {
    /// Config key; the identity of the profile.
    pub key: String,
    /// Display name.
    pub name: String,
    pub video_codec: String,
    pub video_crf: Option<u32>,
    pub video_bitrate: Option<String>,
    /// Target audio codec; `None` means stream-copy every audio track.
    pub audio_codec: Option<String>,
    pub audio_bitrate: Option<String>,
    pub audio_normalize: bool,
    pub subtitles: SubtitleMode,
    pub container: String,
    pub hardware_accel: bool,
    pub preset: String,
}

impl EncodeProfile {
    pub fn from_config(key: &str, cfg: &ProfileConfig) -> Self {
        let audio_codec = if cfg.audio_codec.eq_ignore_ascii_case("copy") {
            None
        } else {
            Some(cfg.audio_codec.to_lowercase())
        };
        let subtitles = if cfg.subtitles.eq_ignore_ascii_case("none") {
            SubtitleMode::None
        } else {
            SubtitleMode::Copy
        };
        Self {
            key: key.to_string(),
            name: if cfg.name.is_empty() {
                key.to_string()
            } else {
                cfg.name.clone()
            },
            video_codec: canonical_codec(&cfg.video_codec),
            video_crf: cfg.video_crf,
            video_bitrate: cfg.video_bitrate.clone(),
            audio_codec,
            audio_bitrate: cfg.audio_bitrate.clone(),
            audio_normalize: cfg.audio_normalize,
            subtitles,
            container: cfg.container.trim_start_matches('.').to_lowercase(),
            hardware_accel: cfg.hardware_accel,
            preset: cfg.preset.clone(),
        }
    }
}

/// A profile bound to the runtime environment: hardware and output location.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProfile {
    pub profile: Arc<EncodeProfile>,
    /// Encoder family actually used for this profile on this host.
    pub hw_accel: HwAccel,
    /// Output directory; outputs land next to the source when unset.
    pub output_dir: Option<PathBuf>,
}

impl ResolvedProfile {
    /// Use `dir` for outputs instead of the source directory.
    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    /// Derive the output path for a source file.
    ///
    /// `<dir>/<stem>_<profile key>.<container>`; the suffix is not appended
    /// twice, and an output that would overwrite its source gets a
    /// `.transcoded` marker.
    pub fn output_path_for(&self, source: &Path) -> PathBuf {
        let dir = self
            .output_dir
            .clone()
            .or_else(|| source.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let suffix = format!("_{}", self.profile.key);
        let stem = if stem.ends_with(&suffix) {
            stem
        } else {
            format!("{}{}", stem, suffix)
        };

        let candidate = dir.join(format!("{}.{}", stem, self.profile.container));
        if candidate == source {
            dir.join(format!("{}.transcoded.{}", stem, self.profile.container))
        } else {
            candidate
        }
    }
}

/// Looks up profiles by key or display name.
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    profiles: BTreeMap<String, Arc<EncodeProfile>>,
    available_accel: HwAccel,
}

impl ProfileResolver {
    /// Build a resolver from configuration.
    ///
    /// `available_accel` is the hardware encoder family detected on this host.
    pub fn from_config(config: &Config, available_accel: HwAccel) -> Self {
        let profiles = config
            .profiles
            .iter()
            .map(|(key, cfg)| (key.clone(), Arc::new(EncodeProfile::from_config(key, cfg))))
            .collect();
        Self {
            profiles,
            available_accel,
        }
    }

    pub fn available_accel(&self) -> HwAccel {
        self.available_accel
    }

    /// All profile keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Resolve a profile by key, falling back to its display name.
    pub fn resolve(&self, name: &str) -> Result<ResolvedProfile, ProfileError> {
        let profile = self
            .profiles
            .get(name)
            .or_else(|| self.profiles.values().find(|p| p.name == name))
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))?;

        let hw_accel = if profile.hardware_accel && supports_hw(&profile.video_codec) {
            self.available_accel
        } else {
            HwAccel::None
        };

        Ok(ResolvedProfile {
            profile,
            hw_accel,
            output_dir: None,
        })
    }
}

/// Hardware encoders are only wired up for H.264 and HEVC.
fn supports_hw(codec: &str) -> bool {
    matches!(codec, "h264" | "hevc")
}
