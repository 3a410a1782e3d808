//! Per-torrent piece selection and pipelining (C10).
pub mod manager;

pub use manager::{
    BlockOutcome, BlockRequest, DownloadManager, TimedOutBlock, BLOCK_TIMEOUT, DEFAULT_ENDGAME_THRESHOLD,
    DEFAULT_PENDING_CAP,
};
