//! Library root for rstorrent.
//!
//! A multi-torrent BitTorrent client engine: peer-wire protocol, DHT,
//! tracker client, piece/file assembly, per-torrent download scheduling,
//! peer pool management, a global queue and durable state, wired together
//! by the top-level [`engine`].
pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod dht;
pub mod download;
pub mod engine;
pub mod error;
pub mod extension;
pub mod ids;
pub mod magnet;
pub mod peer;
pub mod piece;
pub mod queue;
pub mod state;
pub mod torrent;
pub mod tracker;
pub mod wire;
