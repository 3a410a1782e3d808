//! Parses `.torrent` metadata (the `info` dict, trackers, and the
//! bookkeeping fields around it) and the magnet-acquired equivalent
//! delivered piecewise over ut_metadata (spec §4.2, §4.12).
//!
//! Generalizes the teacher's `TorrentFile`/`InfoDict` parser: field
//! extraction and `total_length`/`piece_size`/file-overlap logic are kept,
//! but the info-hash is now computed by SHA-1'ing the *original* bytes of
//! the `info` dict (via [`crate::bencode::decode_with_spans`]) rather than
//! re-encoding a parsed copy, matching this crate's bencode module design.
use crate::bencode::{decode, decode_with_spans, BencodeError, BencodeValue, Dict};
use crate::ids::InfoHash;
use crate::piece::FileEntry;
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("missing or invalid field: {0}")]
    MissingField(String),
    #[error("invalid torrent metadata: {0}")]
    InvalidFormat(String),
    #[error("pieces string length is not a multiple of 20")]
    InvalidPiecesLength,
    #[error("assembled metadata does not hash to the expected info_hash")]
    InfoHashMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub comment: String,
    pub created_by: String,
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileInfo>,
    pub is_directory: bool,
    pub info_hash: InfoHash,
}

fn get_str(dict: &Dict, key: &str) -> Option<String> {
    dict.get(key.as_bytes()).and_then(|v| v.as_bytes()).map(|b| String::from_utf8_lossy(b).into_owned())
}

fn get_int(dict: &Dict, key: &str) -> Option<i64> {
    dict.get(key.as_bytes()).and_then(|v| v.as_integer())
}

fn parse_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>, MetadataError> {
    if pieces.len() % 20 != 0 {
        return Err(MetadataError::InvalidPiecesLength);
    }
    Ok(pieces.chunks_exact(20).map(|c| c.try_into().unwrap()).collect())
}

fn parse_files(info: &Dict) -> Result<(Vec<FileInfo>, bool), MetadataError> {
    match info.get(b"files".as_slice()) {
        Some(BencodeValue::List(entries)) => {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let BencodeValue::Dict(file_dict) = entry else {
                    return Err(MetadataError::InvalidFormat("file entry is not a dict".into()));
                };
                let length = get_int(file_dict, "length")
                    .ok_or_else(|| MetadataError::MissingField("files[].length".into()))?;
                let path = match file_dict.get(b"path".as_slice()) {
                    Some(BencodeValue::List(parts)) => parts
                        .iter()
                        .map(|p| p.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| MetadataError::InvalidFormat("file path component not a string".into()))?,
                    _ => return Err(MetadataError::MissingField("files[].path".into())),
                };
                files.push(FileInfo { path, length: length.max(0) as u64 });
            }
            Ok((files, true))
        }
        _ => {
            let length = get_int(info, "length").ok_or_else(|| MetadataError::MissingField("length".into()))?;
            Ok((vec![FileInfo { path: Vec::new(), length: length.max(0) as u64 }], false))
        }
    }
}

fn parse_info_fields(info: &Dict, info_hash: InfoHash) -> Result<Metadata, MetadataError> {
    let name = get_str(info, "name").ok_or_else(|| MetadataError::MissingField("name".into()))?;
    let piece_length =
        get_int(info, "piece length").ok_or_else(|| MetadataError::MissingField("piece length".into()))?;
    let pieces = info
        .get(b"pieces".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| MetadataError::MissingField("pieces".into()))?;
    let piece_hashes = parse_piece_hashes(pieces)?;
    let (files, is_directory) = parse_files(info)?;

    Ok(Metadata {
        announce: None,
        announce_list: Vec::new(),
        comment: String::new(),
        created_by: String::new(),
        name,
        piece_length: piece_length.max(0) as u64,
        piece_hashes,
        files,
        is_directory,
        info_hash,
    })
}

fn parse_announce_list(value: &BencodeValue) -> Vec<Vec<String>> {
    let BencodeValue::List(tiers) = value else { return Vec::new() };
    tiers
        .iter()
        .filter_map(|tier| {
            let BencodeValue::List(trackers) = tier else { return None };
            Some(trackers.iter().filter_map(|t| t.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())).collect())
        })
        .collect()
}

impl Metadata {
    /// Parses a complete `.torrent` file's bencoded bytes.
    pub fn parse(data: &[u8]) -> Result<Metadata, MetadataError> {
        let spanned = decode_with_spans(data)?;
        let info_span = spanned
            .get(b"info")
            .ok_or_else(|| MetadataError::MissingField("info".into()))?;
        let info_hash_bytes: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update(info_span.raw_bytes(data));
            hasher.finalize().into()
        };
        let info_hash = InfoHash::from_bytes(info_hash_bytes);

        let root = decode(data)?;
        let BencodeValue::Dict(root) = root else {
            return Err(MetadataError::InvalidFormat("root is not a dict".into()));
        };
        let BencodeValue::Dict(info) = root.get(b"info".as_slice()).expect("checked above via span") else {
            return Err(MetadataError::InvalidFormat("info is not a dict".into()));
        };

        let mut metadata = parse_info_fields(info, info_hash)?;
        metadata.announce = get_str(&root, "announce");
        metadata.announce_list = root.get(b"announce-list".as_slice()).map(parse_announce_list).unwrap_or_default();
        metadata.comment = get_str(&root, "comment").unwrap_or_default();
        metadata.created_by = get_str(&root, "created by").unwrap_or_default();
        Ok(metadata)
    }

    /// Parses a raw `info` dict assembled from ut_metadata chunks (magnet
    /// flow). The caller already verified the SHA-1 of `info_bytes` against
    /// the magnet's info_hash; we re-derive it here too so `Metadata` is
    /// never constructed with a mismatched hash.
    pub fn from_info_bytes(info_bytes: &[u8], expected: InfoHash) -> Result<Metadata, MetadataError> {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != *expected.as_bytes() {
            return Err(MetadataError::InfoHashMismatch);
        }
        let value = decode(info_bytes)?;
        let BencodeValue::Dict(info) = value else {
            return Err(MetadataError::InvalidFormat("info is not a dict".into()));
        };
        parse_info_fields(&info, expected)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        if index >= self.num_pieces() {
            return 0;
        }
        let abs_start = index as u64 * self.piece_length;
        (abs_start + self.piece_length).min(self.total_length()) - abs_start
    }

    /// File ranges suitable for [`crate::piece::FileWriter`], rooted under
    /// the torrent's own directory name when it has multiple files.
    pub fn file_entries(&self) -> Vec<FileEntry> {
        self.files
            .iter()
            .map(|f| {
                let path = if self.is_directory {
                    let mut p = PathBuf::from(&self.name);
                    for part in &f.path {
                        p.push(part);
                    }
                    p
                } else {
                    PathBuf::from(&self.name)
                };
                FileEntry { path, length: f.length }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode_to_vec, DictBuilder};

    fn sample_torrent_bytes() -> (Vec<u8>, [u8; 20]) {
        let piece_data = vec![0u8; 16];
        let mut hasher = Sha1::new();
        hasher.update(&piece_data);
        let piece_hash: [u8; 20] = hasher.finalize().into();

        let info = DictBuilder::new()
            .insert("name", BencodeValue::string(*b"example.txt"))
            .insert("piece length", BencodeValue::Integer(16))
            .insert("pieces", BencodeValue::String(piece_hash.to_vec()))
            .insert("length", BencodeValue::Integer(16))
            .build();
        let info_bytes = encode_to_vec(&info).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(&info_bytes);
        let expected_info_hash: [u8; 20] = hasher.finalize().into();

        let torrent = DictBuilder::new()
            .insert("announce", BencodeValue::string(*b"http://tracker.example/announce"))
            .insert("info", info)
            .build();
        (encode_to_vec(&torrent).unwrap(), expected_info_hash)
    }

    #[test]
    fn parses_single_file_torrent_and_hashes_info_from_raw_bytes() {
        let (data, expected_hash) = sample_torrent_bytes();
        let metadata = Metadata::parse(&data).unwrap();
        assert_eq!(metadata.name, "example.txt");
        assert_eq!(metadata.num_pieces(), 1);
        assert_eq!(metadata.total_length(), 16);
        assert_eq!(metadata.info_hash.as_bytes(), expected_hash);
        assert_eq!(metadata.announce.as_deref(), Some("http://tracker.example/announce"));
    }

    #[test]
    fn file_entries_root_multi_file_torrent_under_its_name() {
        let mut metadata = Metadata::parse(&sample_torrent_bytes().0).unwrap();
        metadata.is_directory = true;
        metadata.files = vec![FileInfo { path: vec!["a".into(), "b.txt".into()], length: 16 }];
        let entries = metadata.file_entries();
        assert_eq!(entries[0].path, PathBuf::from("example.txt/a/b.txt"));
    }

    #[test]
    fn rejects_malformed_pieces_length() {
        assert!(matches!(parse_piece_hashes(&[0u8; 19]), Err(MetadataError::InvalidPiecesLength)));
    }
}
