//! Audio file discovery
//!
//! Bounded-depth directory walks yielding audio file paths plus
//! per-directory counts for the library view. Accepted extensions are
//! `.wav`, `.flac`, `.mp3`, and `.ogg`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

const SCAN_EXTENSIONS: &[&str] = &["wav", "flac", "mp3", "ogg"];

/// File count for one scanned directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDirStats {
    pub dir: String,
    #[serde(rename = "fileCount")]
    pub file_count: usize,
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredFiles {
    pub paths: Vec<String>,
    pub stats: Vec<AudioDirStats>,
}

/// Filter audio files up to `recursive_level` deep in one directory.
pub fn filter_audio_files(dir: &Path, recursive_level: Option<usize>) -> Vec<String> {
    let mut result = Vec::new();

    for entry in WalkDir::new(dir)
        .max_depth(recursive_level.unwrap_or(0).max(1))
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_audio = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .is_some_and(|ext| SCAN_EXTENSIONS.contains(&ext.as_str()));
        if is_audio {
            if let Some(path) = entry.path().to_str() {
                result.push(path.to_string());
            }
        }
    }

    result
}

/// Reduce a mixed list of file/dir paths to the unique directories they
/// live in, dropping anything that does not exist.
pub fn parse_dirs_from_paths(paths: &[String]) -> Vec<String> {
    let mut dirs = HashSet::new();

    for path in paths {
        let path = Path::new(path);
        if path.is_file() {
            if let Some(parent) = path.parent() {
                dirs.insert(parent.to_string_lossy().to_string());
            }
        } else if path.is_dir() {
            dirs.insert(path.to_string_lossy().to_string());
        }
    }

    dirs.into_iter().collect()
}

/// Flex search: resolve `paths` to directories, walk each one, and
/// report both the deduplicated file list and per-directory counts.
pub fn discover(paths: &[String], recursive_level: Option<usize>) -> DiscoveredFiles {
    let mut audio_files = HashSet::new();
    let mut stats = Vec::new();

    for dir in parse_dirs_from_paths(paths) {
        let files = filter_audio_files(Path::new(&dir), recursive_level);
        stats.push(AudioDirStats {
            dir,
            file_count: files.len(),
        });
        audio_files.extend(files);
    }

    let mut paths: Vec<String> = audio_files.into_iter().collect();
    paths.sort();
    DiscoveredFiles { paths, stats }
}
