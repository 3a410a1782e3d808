//! Peer-wire session handling: dialing/accepting connections (C4), and the
//! pool that owns and supervises them for one torrent (C11).
pub mod connection;
pub mod health;
pub mod manager;

pub use connection::{ConnId, ConnectionError, PeerCommand, PeerEvent};
pub use health::{PeerHealth, StrikeCause};
pub use manager::{PeerManager, TaggedEvent};
