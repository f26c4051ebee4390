//! Persistent library state
//!
//! Three files live in the data directory:
//! - `library.json`: scanned file list, per-directory stats, scan depth,
//!   and the content hash of the last written binary cache
//! - `history.json`: recently played assets, most recent last,
//!   deduplicated by path and capped at 50 entries
//! - `library.bin`: the full asset list, bincode-encoded and
//!   zlib-compressed; its SHA-256 decides whether a rewrite is needed

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{AudioAsset, AudioDirStats, LibraryError, LibraryResult};

pub const HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryState {
    #[serde(rename = "audioFiles", default)]
    pub audio_files: Vec<String>,
    #[serde(rename = "libraryStats", default)]
    pub library_stats: Vec<AudioDirStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryFile {
    #[serde(default)]
    pub library: LibraryState,
    #[serde(rename = "scanRecursiveLevel", default)]
    pub scan_recursive_level: usize,
    #[serde(rename = "lastLibbinHash", default)]
    pub last_libbin_hash: Option<String>,
}

impl Default for LibraryFile {
    fn default() -> Self {
        Self {
            library: LibraryState::default(),
            scan_recursive_level: 0,
            last_libbin_hash: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFile {
    #[serde(default)]
    pub history: Vec<AudioAsset>,
}

/// File-backed store rooted at one data directory.
pub struct LibraryStore {
    root: PathBuf,
}

impl LibraryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn library_path(&self) -> PathBuf {
        self.root.join("library.json")
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    fn cache_path(&self) -> PathBuf {
        self.root.join("library.bin")
    }

    // ───────────────────────────────────────────────────────────────────
    // JSON stores
    // ───────────────────────────────────────────────────────────────────

    pub fn load_library(&self) -> LibraryResult<LibraryFile> {
        read_json_or_default(&self.library_path())
    }

    pub fn save_library(&self, library: &LibraryFile) -> LibraryResult<()> {
        write_json(&self.library_path(), library)
    }

    pub fn load_history(&self) -> LibraryResult<HistoryFile> {
        read_json_or_default(&self.history_path())
    }

    pub fn save_history(&self, history: &HistoryFile) -> LibraryResult<()> {
        write_json(&self.history_path(), history)
    }

    /// Append one played asset: dedup by path, most recent last, capped.
    pub fn push_history(&self, asset: AudioAsset) -> LibraryResult<HistoryFile> {
        let mut file = self.load_history()?;
        file.history.retain(|entry| entry.path != asset.path);
        file.history.push(asset);
        if file.history.len() > HISTORY_CAP {
            let excess = file.history.len() - HISTORY_CAP;
            file.history.drain(0..excess);
        }
        self.save_history(&file)?;
        Ok(file)
    }

    // ───────────────────────────────────────────────────────────────────
    // Binary metadata cache
    // ───────────────────────────────────────────────────────────────────

    /// SHA-256 over the bincode encoding of the asset list.
    pub fn metadata_hash(assets: &[AudioAsset]) -> LibraryResult<String> {
        let encoded = bincode::encode_to_vec(assets, bincode::config::standard())
            .map_err(|e| LibraryError::Cache(e.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Write `library.bin` unless the content hash matches `last_hash`.
    /// Returns the new hash when a write happened.
    pub fn write_cache_if_changed(
        &self,
        assets: &[AudioAsset],
        last_hash: Option<&str>,
    ) -> LibraryResult<Option<String>> {
        let hash = Self::metadata_hash(assets)?;
        if last_hash == Some(hash.as_str()) {
            return Ok(None);
        }
        self.save_cache(assets)?;
        Ok(Some(hash))
    }

    pub fn save_cache(&self, assets: &[AudioAsset]) -> LibraryResult<u64> {
        let encoded = bincode::encode_to_vec(assets, bincode::config::standard())
            .map_err(|e| LibraryError::Cache(e.to_string()))?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&encoded)
            .map_err(|e| LibraryError::Cache(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| LibraryError::Cache(e.to_string()))?;

        std::fs::write(self.cache_path(), &compressed).map_err(|e| LibraryError::Write {
            path: self.cache_path().display().to_string(),
            message: e.to_string(),
        })?;
        Ok(compressed.len() as u64)
    }

    pub fn load_cache(&self) -> LibraryResult<Vec<AudioAsset>> {
        let compressed = std::fs::read(self.cache_path()).map_err(|e| LibraryError::Read {
            path: self.cache_path().display().to_string(),
            message: e.to_string(),
        })?;

        let mut decoder = ZlibDecoder::new(Vec::new());
        decoder
            .write_all(&compressed)
            .map_err(|e| LibraryError::Cache(e.to_string()))?;
        let decoded = decoder
            .finish()
            .map_err(|e| LibraryError::Cache(e.to_string()))?;

        let (assets, _) = bincode::decode_from_slice(&decoded, bincode::config::standard())
            .map_err(|e| LibraryError::Cache(e.to_string()))?;
        Ok(assets)
    }
}

fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> LibraryResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| LibraryError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| LibraryError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> LibraryResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| LibraryError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    std::fs::write(path, json).map_err(|e| LibraryError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
