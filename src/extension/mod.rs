//! BEP 10 extension handshake and BEP 9 `ut_metadata` piece exchange (spec
//! §4.5), used to fetch torrent metadata from peers for magnet links.
use crate::bencode::{BencodeError, BencodeValue, DictBuilder};
use crate::ids::InfoHash;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const UT_METADATA_NAME: &str = "ut_metadata";
pub const METADATA_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("extended handshake missing 'm' dict")]
    MissingExtensionDict,
    #[error("unknown ut_metadata msg_type {0}")]
    UnknownMsgType(i64),
    #[error("piece index {piece} out of range (have {num_pieces} pieces)")]
    PieceOutOfRange { piece: usize, num_pieces: usize },
    #[error("metadata reply larger than declared size")]
    OversizedReply,
    #[error("assembled metadata does not hash to the expected info_hash")]
    HashMismatch,
}

fn encode(value: BencodeValue) -> Vec<u8> {
    crate::bencode::encode_to_vec(&value).expect("encoding an in-memory BencodeValue cannot fail")
}

/// Our own extended-handshake `m` dict advertises one extension: a locally
/// chosen message id for `ut_metadata`.
pub fn build_extended_handshake(our_ut_metadata_id: u8, metadata_size: Option<usize>) -> Vec<u8> {
    let m = DictBuilder::new()
        .insert(UT_METADATA_NAME, BencodeValue::string(vec![our_ut_metadata_id]))
        .build();
    let mut builder = DictBuilder::new().insert("m", m);
    if let Some(size) = metadata_size {
        builder = builder.insert("metadata_size", BencodeValue::Integer(size as i64));
    }
    encode(builder.build())
}

/// What we learn about a peer's extension support from their handshake.
#[derive(Debug, Clone)]
pub struct PeerExtensions {
    pub ut_metadata_id: Option<u8>,
    pub metadata_size: Option<usize>,
}

pub fn parse_extended_handshake(payload: &[u8]) -> Result<PeerExtensions, ExtensionError> {
    let value = crate::bencode::decode(payload)?;
    let dict = value.as_dict().ok_or(ExtensionError::MissingExtensionDict)?;
    let m = dict.get(b"m".as_slice()).and_then(BencodeValue::as_dict);
    let ut_metadata_id = m
        .and_then(|m| m.get(UT_METADATA_NAME.as_bytes()))
        .and_then(BencodeValue::as_bytes)
        .and_then(|b| b.first().copied());
    let metadata_size = dict
        .get(b"metadata_size".as_slice())
        .and_then(BencodeValue::as_integer)
        .map(|n| n as usize);
    Ok(PeerExtensions { ut_metadata_id, metadata_size })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtMetadataMessage {
    Request { piece: usize },
    Data { piece: usize, total_size: usize },
    Reject { piece: usize },
}

impl UtMetadataMessage {
    fn msg_type(&self) -> i64 {
        match self {
            UtMetadataMessage::Request { .. } => 0,
            UtMetadataMessage::Data { .. } => 1,
            UtMetadataMessage::Reject { .. } => 2,
        }
    }

    /// Encodes the bencoded header; for `Data`, the raw piece bytes must be
    /// appended by the caller (spec §4.5: "followed by raw bytes").
    pub fn encode_header(&self) -> Vec<u8> {
        let piece = match self {
            UtMetadataMessage::Request { piece }
            | UtMetadataMessage::Data { piece, .. }
            | UtMetadataMessage::Reject { piece } => *piece,
        };
        let mut builder = DictBuilder::new()
            .insert("msg_type", BencodeValue::Integer(self.msg_type()))
            .insert("piece", BencodeValue::Integer(piece as i64));
        if let UtMetadataMessage::Data { total_size, .. } = self {
            builder = builder.insert("total_size", BencodeValue::Integer(*total_size as i64));
        }
        encode(builder.build())
    }

    /// Parses a payload that may have trailing raw bytes (only meaningful
    /// for `Data`); returns the message and the byte offset where the raw
    /// block begins.
    pub fn parse(payload: &[u8]) -> Result<(Self, usize), ExtensionError> {
        let spanned = crate::bencode::decode_with_spans(payload)?;
        let header_len = spanned.span().end;
        let value = spanned.into_value();
        let dict = value.as_dict().ok_or(ExtensionError::MissingExtensionDict)?;
        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(BencodeValue::as_integer)
            .ok_or(ExtensionError::MissingExtensionDict)?;
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(BencodeValue::as_integer)
            .ok_or(ExtensionError::MissingExtensionDict)? as usize;
        let message = match msg_type {
            0 => UtMetadataMessage::Request { piece },
            1 => {
                let total_size = dict
                    .get(b"total_size".as_slice())
                    .and_then(BencodeValue::as_integer)
                    .ok_or(ExtensionError::MissingExtensionDict)? as usize;
                UtMetadataMessage::Data { piece, total_size }
            }
            2 => UtMetadataMessage::Reject { piece },
            other => return Err(ExtensionError::UnknownMsgType(other)),
        };
        Ok((message, header_len))
    }
}

/// Accumulates 16 KiB metadata chunks until the whole `info` dict is
/// present, then validates it against the expected info_hash (spec §4.5).
pub struct MetadataAssembler {
    total_size: usize,
    num_pieces: usize,
    chunks: Vec<Option<Bytes>>,
    attempts_per_piece: Vec<u32>,
}

const MAX_ATTEMPTS_PER_PIECE: u32 = 3;

impl MetadataAssembler {
    pub fn new(total_size: usize) -> Self {
        let num_pieces = total_size.div_ceil(METADATA_CHUNK_SIZE).max(1);
        Self {
            total_size,
            num_pieces,
            chunks: vec![None; num_pieces],
            attempts_per_piece: vec![0; num_pieces],
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn next_missing_piece(&self) -> Option<usize> {
        self.chunks
            .iter()
            .enumerate()
            .find(|(i, chunk)| chunk.is_none() && self.attempts_per_piece[*i] < MAX_ATTEMPTS_PER_PIECE)
            .map(|(i, _)| i)
    }

    pub fn record_attempt(&mut self, piece: usize) {
        if let Some(count) = self.attempts_per_piece.get_mut(piece) {
            *count += 1;
        }
    }

    pub fn piece_exhausted(&self, piece: usize) -> bool {
        self.attempts_per_piece.get(piece).copied().unwrap_or(0) >= MAX_ATTEMPTS_PER_PIECE
    }

    /// Stores a received chunk. Rejects out-of-range indices and replies
    /// that would overflow the declared total size.
    pub fn accept_chunk(&mut self, piece: usize, data: Bytes) -> Result<(), ExtensionError> {
        if piece >= self.num_pieces {
            return Err(ExtensionError::PieceOutOfRange { piece, num_pieces: self.num_pieces });
        }
        let offset = piece * METADATA_CHUNK_SIZE;
        if offset + data.len() > self.total_size {
            return Err(ExtensionError::OversizedReply);
        }
        self.chunks[piece] = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    /// Concatenates all chunks and validates the SHA-1 digest matches
    /// `info_hash`; on mismatch every chunk is discarded so the caller can
    /// re-request from scratch (spec §4.5).
    pub fn finish(&mut self, info_hash: &InfoHash) -> Result<Vec<u8>, ExtensionError> {
        let mut buf = Vec::with_capacity(self.total_size);
        for chunk in self.chunks.iter().flatten() {
            buf.extend_from_slice(chunk);
        }
        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != *info_hash.as_bytes() {
            self.chunks = vec![None; self.num_pieces];
            return Err(ExtensionError::HashMismatch);
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_handshake_round_trips() {
        let bytes = build_extended_handshake(3, Some(32_768));
        let parsed = parse_extended_handshake(&bytes).unwrap();
        assert_eq!(parsed.ut_metadata_id, Some(3));
        assert_eq!(parsed.metadata_size, Some(32_768));
    }

    #[test]
    fn request_message_round_trips() {
        let msg = UtMetadataMessage::Request { piece: 2 };
        let bytes = msg.encode_header();
        let (parsed, _) = UtMetadataMessage::parse(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn assembler_rejects_out_of_range_piece() {
        let mut asm = MetadataAssembler::new(16 * 1024);
        assert_eq!(asm.num_pieces(), 1);
        assert!(matches!(
            asm.accept_chunk(5, Bytes::from_static(b"x")),
            Err(ExtensionError::PieceOutOfRange { .. })
        ));
    }

    #[test]
    fn assembler_detects_hash_mismatch_and_clears() {
        let mut asm = MetadataAssembler::new(4);
        asm.accept_chunk(0, Bytes::from_static(b"fake")).unwrap();
        assert!(asm.is_complete());
        let bogus_hash = InfoHash::random();
        let err = asm.finish(&bogus_hash).unwrap_err();
        assert!(matches!(err, ExtensionError::HashMismatch));
        assert!(!asm.is_complete());
    }

    #[test]
    fn assembler_validates_against_real_hash() {
        let data = b"d4:name3:fooe".to_vec();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest: [u8; 20] = hasher.finalize().into();
        let info_hash = InfoHash::from_bytes(digest);

        let mut asm = MetadataAssembler::new(data.len());
        asm.accept_chunk(0, Bytes::from(data.clone())).unwrap();
        let assembled = asm.finish(&info_hash).unwrap();
        assert_eq!(assembled, data);
    }
}
