//! The BitTorrent peer-wire protocol: the 68-byte handshake and the
//! length-prefixed message stream that follows it (spec §4.3/§4.4).
pub mod handshake;
pub mod message;

pub use handshake::Handshake;
pub use message::{read_message, write_message, PeerMessage, MAX_PIECE_MESSAGE_LEN};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("invalid protocol identifier")]
    InvalidProtocol,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("message frame too large ({0} bytes)")]
    FrameTooLarge(u32),

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("malformed message payload: {0}")]
    MalformedPayload(String),
}

pub type WireResult<T> = std::result::Result<T, WireError>;
