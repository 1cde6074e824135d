//! Scanner for media files already present in watch folders.
//!
//! Walks each configured folder once, filtering by the folder's extension
//! list. The daemon feeds the candidates through the same path as live
//! file events.

use recodex_config::WatchFolderConfig;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// A candidate media file discovered during a scan.
#[derive(Debug, Clone)]
pub struct ScanCandidate {
    /// Full path to the file.
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
    /// Last modified time of the file.
    pub modified_time: SystemTime,
}

/// Checks if `path` has one of `extensions` (with leading dot, case-insensitive).
pub fn has_media_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = format!(".{}", ext.to_lowercase());
            extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Checks if `path` is an encoder temporary file (`<name>.tmp.<ext>`).
pub fn is_temp_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.ends_with(".tmp"))
        .unwrap_or(false)
}

/// Whether a file at `path` belongs to `folder`: under its root (directly
/// unless recursive), a media extension and not an encoder temp file.
pub fn is_candidate(folder: &WatchFolderConfig, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(&folder.path) else {
        return false;
    };
    if !folder.recursive && relative.components().count() > 1 {
        return false;
    }
    has_media_extension(path, &folder.extensions) && !is_temp_output(path)
}

/// Scans a watch folder for candidate files.
///
/// Hidden directories (names starting with `.`) are skipped, the root
/// itself excepted. A missing root yields no candidates.
pub fn scan_watch_folder(folder: &WatchFolderConfig) -> Vec<ScanCandidate> {
    if !folder.path.exists() {
        return Vec::new();
    }

    let max_depth = if folder.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(&folder.path)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            !(entry.file_type().is_dir() && hidden && entry.depth() > 0)
        });

    let mut candidates = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !has_media_extension(path, &folder.extensions) || is_temp_output(path) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            candidates.push(ScanCandidate {
                path: path.to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    candidates
}
