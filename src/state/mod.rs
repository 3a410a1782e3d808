//! Atomic JSON persistence with backup rotation (spec §4.14). Grounded on
//! the teacher's `FileWriter`-style "open handles, do blocking I/O on
//! `spawn_blocking`" pattern, generalized from piece bytes to the whole
//! engine snapshot; `serde_json` is a new dependency (noted in DESIGN.md)
//! since nothing in the teacher's stack covers plain JSON.
use crate::ids::InfoHash;
use crate::torrent::{FileSelection, Priority, TorrentSource, TorrentState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const TMP_FILE: &str = "state.tmp.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("malformed state file: {0}")]
    Decode(String),
    #[error("state file failed validation: {0}")]
    Validation(String),
    #[error("no valid state file or backup found")]
    NoValidState,
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn io_err(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SourceDoc {
    #[serde(rename = "magnet")]
    Magnet { magnet: String },
    #[serde(rename = "path")]
    Path { path: PathBuf },
}

impl From<&TorrentSource> for SourceDoc {
    fn from(source: &TorrentSource) -> Self {
        match source {
            TorrentSource::Magnet(uri) => SourceDoc::Magnet { magnet: uri.clone() },
            TorrentSource::File(path) => SourceDoc::Path { path: path.clone() },
        }
    }
}

impl From<SourceDoc> for TorrentSource {
    fn from(doc: SourceDoc) -> Self {
        match doc {
            SourceDoc::Magnet { magnet } => TorrentSource::Magnet(magnet),
            SourceDoc::Path { path } => TorrentSource::File(path),
        }
    }
}

/// One torrent's persisted row (spec §6 state schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTorrent {
    pub info_hash: String,
    pub source: SourceDoc,
    pub download_path: PathBuf,
    pub priority: Priority,
    pub state: TorrentState,
    pub completed_pieces: Vec<u32>,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub added_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_selection: Option<FileSelection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub max_concurrent: usize,
    pub global_upload_limit: u64,
    pub global_download_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStateFile {
    pub version: u32,
    pub saved_at: i64,
    pub settings: PersistedSettings,
    pub torrents: HashMap<String, PersistedTorrent>,
}

impl EngineStateFile {
    fn validate(&self) -> Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::Validation(format!("unsupported version {}", self.version)));
        }
        Ok(())
    }
}

/// Owns the on-disk snapshot location and rotation policy. Holds no live
/// torrent state itself; `Engine` builds an [`EngineStateFile`] on save and
/// consumes one on load.
pub struct StateManager {
    dir: PathBuf,
    backup_count: usize,
}

impl StateManager {
    pub fn new(dir: PathBuf, backup_count: usize) -> Self {
        Self { dir, backup_count }
    }

    fn main_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn tmp_path(&self) -> PathBuf {
        self.dir.join(TMP_FILE)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("state.backup.{index}.json"))
    }

    /// Writes `doc` to `state.tmp.json`, rotates existing backups, then
    /// renames tmp over the main file (spec §4.14). The rename is the
    /// atomicity boundary: a crash before it leaves the previous
    /// `state.json` untouched.
    pub async fn save(&self, doc: EngineStateFile) -> Result<(), StateError> {
        let dir = self.dir.clone();
        let main_path = self.main_path();
        let tmp_path = self.tmp_path();
        let backup_count = self.backup_count;
        let backup_paths: Vec<PathBuf> = (0..backup_count).map(|i| self.backup_path(i)).collect();

        tokio::task::spawn_blocking(move || -> Result<(), StateError> {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| StateError::Decode(e.to_string()))?;
            std::fs::write(&tmp_path, &bytes).map_err(|e| io_err(&tmp_path, e))?;

            if main_path.exists() {
                for i in (0..backup_count.saturating_sub(1)).rev() {
                    let from = &backup_paths[i];
                    let to = &backup_paths[i + 1];
                    if from.exists() {
                        let _ = std::fs::rename(from, to);
                    }
                }
                if let Some(first_backup) = backup_paths.first() {
                    std::fs::rename(&main_path, first_backup).map_err(|e| io_err(&main_path, e))?;
                }
            }
            std::fs::rename(&tmp_path, &main_path).map_err(|e| io_err(&main_path, e))?;
            Ok(())
        })
        .await?
    }

    /// Loads and validates the main state file; on failure, walks backups
    /// oldest-index-first (i.e. most-recent backup first) for the first one
    /// that parses and validates, and rewrites it as main (spec §4.14).
    pub async fn load(&self) -> Result<EngineStateFile, StateError> {
        let main_path = self.main_path();
        let backup_paths: Vec<PathBuf> = (0..self.backup_count).map(|i| self.backup_path(i)).collect();

        tokio::task::spawn_blocking(move || -> Result<EngineStateFile, StateError> {
            if let Some(doc) = Self::try_read(&main_path) {
                return Ok(doc);
            }
            for backup in &backup_paths {
                if let Some(doc) = Self::try_read(backup) {
                    let bytes = serde_json::to_vec_pretty(&doc).map_err(|e| StateError::Decode(e.to_string()))?;
                    std::fs::write(&main_path, bytes).map_err(|e| io_err(&main_path, e))?;
                    return Ok(doc);
                }
            }
            Err(StateError::NoValidState)
        })
        .await?
    }

    fn try_read(path: &Path) -> Option<EngineStateFile> {
        let bytes = std::fs::read(path).ok()?;
        let doc: EngineStateFile = serde_json::from_slice(&bytes).ok()?;
        doc.validate().ok()?;
        Some(doc)
    }
}

#[allow(dead_code)]
pub fn torrent_row(info_hash: &InfoHash) -> String {
    info_hash.to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> EngineStateFile {
        let mut torrents = HashMap::new();
        torrents.insert(
            "a".repeat(40),
            PersistedTorrent {
                info_hash: "a".repeat(40),
                source: SourceDoc::Magnet { magnet: "magnet:?xt=urn:btih:aaaa".to_string() },
                download_path: PathBuf::from("/tmp/x"),
                priority: Priority::Normal,
                state: TorrentState::Downloading,
                completed_pieces: vec![0, 1, 2],
                downloaded_bytes: 100,
                uploaded_bytes: 0,
                added_at: 0,
                file_selection: None,
            },
        );
        EngineStateFile {
            version: STATE_VERSION,
            saved_at: 0,
            settings: PersistedSettings { max_concurrent: 5, global_upload_limit: 0, global_download_limit: 0 },
            torrents,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(dir.path().to_path_buf(), 3);
        mgr.save(sample_doc()).await.unwrap();
        let loaded = mgr.load().await.unwrap();
        assert_eq!(loaded.torrents.len(), 1);
        assert!(dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn save_rotates_backups() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(dir.path().to_path_buf(), 2);
        let mut doc = sample_doc();
        mgr.save(doc.clone()).await.unwrap();
        doc.saved_at = 1;
        mgr.save(doc.clone()).await.unwrap();
        doc.saved_at = 2;
        mgr.save(doc).await.unwrap();
        assert!(dir.path().join("state.backup.0.json").exists());
    }

    #[tokio::test]
    async fn load_falls_back_to_backup_when_main_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(dir.path().to_path_buf(), 2);
        mgr.save(sample_doc()).await.unwrap();
        std::fs::write(dir.path().join("state.json"), b"not json").unwrap();
        let loaded = mgr.load().await.unwrap();
        assert_eq!(loaded.torrents.len(), 1);
    }

    #[tokio::test]
    async fn load_with_no_files_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = StateManager::new(dir.path().to_path_buf(), 2);
        assert!(mgr.load().await.is_err());
    }
}
