//! Codec and container name normalization.
//!
//! ffprobe, ffmpeg encoders and config files all spell the same codec
//! differently (`h264`, `avc`, `libx264`, `h264_nvenc`). Comparisons go
//! through the canonical names defined here.

/// Canonical name for a video or audio codec.
pub fn canonical_codec(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    let canonical = match lower.as_str() {
        "h264" | "avc" | "avc1" | "x264" | "libx264" | "h264_nvenc" | "h264_qsv"
        | "h264_vaapi" | "h264_amf" => "h264",
        "h265" | "hevc" | "x265" | "libx265" | "hevc_nvenc" | "hevc_qsv" | "hevc_vaapi"
        | "hevc_amf" => "hevc",
        "av1" | "libaom-av1" | "libsvtav1" | "librav1e" | "av1_nvenc" | "av1_qsv"
        | "av1_vaapi" => "av1",
        "vp9" | "libvpx-vp9" => "vp9",
        "aac" | "libfdk_aac" => "aac",
        "opus" | "libopus" => "opus",
        "mp3" | "libmp3lame" => "mp3",
        "ac3" | "eac3" => lower.as_str(),
        other => other,
    };
    canonical.to_string()
}

/// Canonical name for a container.
///
/// Accepts both config spellings (`mkv`, `mp4`) and ffprobe's comma-separated
/// demuxer lists (`matroska,webm`, `mov,mp4,m4a,3gp,3g2,mj2`).
pub fn canonical_container(name: &str) -> String {
    let lower = name.trim().trim_start_matches('.').to_lowercase();
    let first = lower.split(',').next().unwrap_or("").trim();
    let canonical = match first {
        "matroska" | "mkv" => "mkv",
        "webm" => "webm",
        "mov" | "mp4" | "m4v" | "m4a" => "mp4",
        "avi" => "avi",
        "mpegts" | "ts" | "m2ts" => "ts",
        other => other,
    };
    canonical.to_string()
}

/// Whether two codec names refer to the same codec.
pub fn same_codec(a: &str, b: &str) -> bool {
    canonical_codec(a) == canonical_codec(b)
}

/// Whether two container names refer to the same container.
pub fn same_container(a: &str, b: &str) -> bool {
    canonical_container(a) == canonical_container(b)
}

/// Parse a bitrate such as `2M`, `1500k` or `800000` into bits per second.
pub fn parse_bitrate(value: &str) -> Option<u64> {
    let lower = value.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    let (number, multiplier) = if let Some(n) = lower.strip_suffix('k') {
        (n, 1_000.0)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1_000_000.0)
    } else {
        (lower.as_str(), 1.0)
    };
    let parsed: f64 = number.trim().parse().ok()?;
    if parsed < 0.0 || !parsed.is_finite() {
        return None;
    }
    Some((parsed * multiplier) as u64)
}
