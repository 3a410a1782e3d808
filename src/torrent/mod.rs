//! Per-torrent lifecycle state machine (spec §4.12): composes the wire
//! codec, peer manager, download manager, extension protocol, tracker
//! client and DHT lookups into one actor task per torrent.
//!
//! Generalizes the teacher's file-oriented `TorrentFile`/`InfoDict` parser
//! (kept for reference in [`metadata`], which replaces it) into a running
//! state machine; there is no teacher equivalent of the actor itself, so
//! its task-per-component shape is grounded in the peer connection's
//! "typed messages instead of an emitter/listener callback" redesign
//! (spec §9), generalized from one socket to everything one torrent owns.
use crate::ids::InfoHash;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub mod actor;
pub mod metadata;

pub use actor::{SpawnParams, Torrent, TorrentCommand, TorrentHandle};
pub use metadata::{Metadata, MetadataError};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    FileWriter(#[from] crate::piece::FileWriterError),
    #[error("no metadata source available to fetch metadata from")]
    NoMetadataSource,
    #[error("invalid state transition: cannot {action} while {current:?}")]
    InvalidTransition { action: &'static str, current: TorrentState },
    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Lifecycle states (spec §4.12). `Seeding` vs `Completed` follows the
/// Open Question resolution in SPEC_FULL.md §4: seeding means complete AND
/// accepting inbound peers; completed (here, reached only via explicit
/// pause-after-completion) means complete and not accepting connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentState {
    Idle,
    FetchingMetadata,
    Checking,
    Downloading,
    Seeding,
    Completed,
    Paused,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Where a torrent's metadata came from, preserved so the state manager can
/// persist and later reconstruct it (spec §6 persisted state schema).
#[derive(Debug, Clone)]
pub enum TorrentSource {
    Magnet(String),
    File(PathBuf),
}

/// Which files (by index into `Metadata::files`) to actually download
/// (spec §6 `set_file_selection`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSelection {
    All,
    Indices(Vec<usize>),
}

impl Default for FileSelection {
    fn default() -> Self {
        FileSelection::All
    }
}

/// Host-facing event payloads (spec §4.12/§6). Carries serializable data so
/// an out-of-scope HTTP/event-fanout layer could forward these unchanged
/// (SPEC_FULL.md §2, C12 additions); `Torrent` itself only ever emits them
/// on an internal channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TorrentEvent {
    Added,
    Ready,
    MetadataComplete,
    Started,
    Piece { index: u32, total: usize, completed_count: usize },
    Progress(TorrentStats),
    Completed,
    Paused,
    Resumed,
    Removed,
    Error { reason: String },
    PeerConnected { addr: String },
    PeerDisconnected { addr: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TorrentStats {
    pub info_hash: Option<String>,
    pub state: Option<TorrentState>,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub num_pieces: usize,
    pub completed_pieces: usize,
    pub completed_piece_indices: Vec<u32>,
    pub connected_peers: usize,
    pub download_rate_bps: u64,
    pub upload_rate_bps: u64,
}

/// Tagged event for the engine's aggregate event sink (spec §6 event
/// stream; spec §5 "consumers must tolerate out-of-order cross-torrent
/// events, same-torrent ordering is preserved").
#[derive(Debug, Clone)]
pub struct TaggedTorrentEvent {
    pub info_hash: InfoHash,
    pub event: TorrentEvent,
}
