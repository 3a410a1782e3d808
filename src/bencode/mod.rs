//! Bencode codec.
//!
//! Bencode is the serialization format used throughout BitTorrent: `.torrent`
//! files, tracker announce responses, KRPC (DHT) messages and the ut_metadata
//! extension all speak it. This module decodes/encodes the four bencode
//! kinds (integer, byte-string, list, dict) and additionally exposes, via
//! [`decoder::decode_with_spans`], the byte range each decoded value occupied
//! in the source buffer so the `info` dictionary of a `.torrent` file can be
//! SHA-1 hashed from its original bytes instead of a re-encoding (which would
//! not round-trip for non-canonical input).
//!
//! Byte-strings are never assumed to be UTF-8: the `pieces` field of an info
//! dict is raw SHA-1 hash bytes, not text.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_with_spans};
pub use encoder::{encode, encode_to_vec};

/// Dictionary keys are sorted bytewise ascending, matching the wire
/// requirement that encoded dicts emit keys in that order. `BTreeMap` gives
/// us this for free on both decode and encode.
pub type Dict = BTreeMap<Vec<u8>, BencodeValue>;

#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Dict),
}

impl BencodeValue {
    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        BencodeValue::String(s.into())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get<'a>(&'a self, key: &[u8]) -> Option<&'a BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }
}

/// Builds a [`BencodeValue::Dict`] without hand-juggling `BTreeMap` inserts at
/// call sites (KRPC queries/replies and the ut_metadata handshake dict are
/// built this way).
#[derive(Default)]
pub struct DictBuilder(Dict);

impl DictBuilder {
    pub fn new() -> Self {
        Self(Dict::new())
    }

    pub fn insert(mut self, key: &str, value: BencodeValue) -> Self {
        self.0.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn build(self) -> BencodeValue {
        BencodeValue::Dict(self.0)
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("bad number: {0}")]
    BadNumber(String),

    #[error("duplicate or unordered dictionary key")]
    DuplicateOrUnorderedKey,

    #[error("trailing garbage after top-level value")]
    TrailingGarbage,

    #[error("invalid bencode: {0}")]
    InvalidFormat(String),

    #[error("dictionary keys must be strings")]
    DictKeyNotString,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
