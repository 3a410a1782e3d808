//! The single error type that crosses the control-interface boundary (spec
//! §6/§7): every `Engine` command returns `Result<_, EngineError>`. Every
//! component keeps its own `thiserror` type for internal use (bencode,
//! wire, tracker, dht, torrent); this enum only wraps the subset that a
//! host process needs to distinguish when a command fails.
use crate::ids::InfoHash;
use crate::magnet::MagnetError;
use crate::state::StateError;
use crate::torrent::{TorrentError, TorrentState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown torrent {0}")]
    UnknownTorrent(InfoHash),

    #[error("torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("invalid state transition for {info_hash}: cannot {action} while {current:?}")]
    InvalidTransition { info_hash: InfoHash, action: &'static str, current: TorrentState },

    #[error("invalid magnet URI: {0}")]
    Magnet(#[from] MagnetError),

    #[error("invalid torrent source: {0}")]
    InvalidSource(String),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine is shutting down")]
    ShuttingDown,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
