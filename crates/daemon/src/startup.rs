//! Startup checks
//!
//! Preflight checks run before the daemon accepts work:
//! - ffmpeg and ffprobe are installed and runnable
//! - the ffmpeg version is recent enough for `-progress` and `loudnorm`
//! - which hardware encoder family, if any, this host offers

use crate::profile::HwAccel;
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest ffmpeg major version known to work
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// DRM render node used for VAAPI and QSV
const RENDER_NODE: &str = "/dev/dri/renderD128";

/// PCI vendor file of the render node's device
const RENDER_NODE_VENDOR: &str = "/sys/class/drm/renderD128/device/vendor";

/// Intel's PCI vendor id
const INTEL_VENDOR_ID: &str = "0x8086";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{binary} not available: {detail}")]
    BinaryUnavailable { binary: String, detail: String },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the startup checks found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    /// Major ffmpeg version; `None` for builds without a release number.
    pub ffmpeg_major: Option<u32>,
    pub hw_accel: HwAccel,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
///
/// Git snapshots ("N-113000-g...") carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_lowercase();
    let version_part = lower.split("ffmpeg version").nth(1)?.split_whitespace().next()?;

    let version_str = version_part.strip_prefix('n').unwrap_or(version_part);

    // Major version ends at the first '.' or '-'
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;
    major_str.parse().ok()
}

/// Run `<binary> -version` and return its stdout.
fn run_version(binary: &str) -> Result<String, StartupError> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::BinaryUnavailable {
            binary: binary.to_string(),
            detail: format!("{} -version failed; is it installed and in PATH? Error: {}", binary, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::BinaryUnavailable {
            binary: binary.to_string(),
            detail: format!("{} -version exited with {}", binary, output.status),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Check that ffmpeg runs and is not older than [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg() -> Result<Option<u32>, StartupError> {
    let output = run_version("ffmpeg")?;
    let major = parse_ffmpeg_version(&output);
    check_ffmpeg_major(major, &output)?;
    Ok(major)
}

fn check_ffmpeg_major(major: Option<u32>, output: &str) -> Result<(), StartupError> {
    match major {
        Some(major) if major < MIN_FFMPEG_MAJOR => Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        ))),
        Some(_) => Ok(()),
        None => {
            warn!(
                version = output.lines().next().unwrap_or("(empty)"),
                "Could not parse FFmpeg version, assuming a recent build"
            );
            Ok(())
        }
    }
}

/// Check that ffprobe runs
pub fn check_ffprobe() -> Result<(), StartupError> {
    run_version("ffprobe").map(|_| ())
}

/// Pick the hardware encoder family from what the host exposes.
///
/// NVIDIA wins over a render node; an Intel render node means QSV.
pub fn classify_hw_accel(nvidia: bool, render_node: bool, vendor: Option<&str>) -> HwAccel {
    if nvidia {
        HwAccel::Nvenc
    } else if render_node && vendor.map(str::trim) == Some(INTEL_VENDOR_ID) {
        HwAccel::Qsv
    } else if render_node {
        HwAccel::Vaapi
    } else {
        HwAccel::None
    }
}

/// Detect the hardware encoder family available on this host.
///
/// `nvidia-smi` succeeding means NVENC; a DRM render node means VAAPI, or
/// QSV when the device is Intel.
pub fn detect_hw_accel() -> HwAccel {
    let nvidia = Command::new("nvidia-smi")
        .arg("-L")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    let render_node = Path::new(RENDER_NODE).exists();
    let vendor = std::fs::read_to_string(RENDER_NODE_VENDOR).ok();

    classify_hw_accel(nvidia, render_node, vendor.as_deref())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg availability and version
/// 2. ffprobe availability
/// 3. hardware detection (never fails)
pub fn run_startup_checks() -> Result<StartupReport, StartupError> {
    let ffmpeg_major = check_ffmpeg()?;
    check_ffprobe()?;
    let hw_accel = detect_hw_accel();
    info!(ffmpeg_major = ?ffmpeg_major, hw_accel = %hw_accel, "Startup checks passed");
    Ok(StartupReport {
        ffmpeg_major,
        hw_accel,
    })
}
