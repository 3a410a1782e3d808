//! Magnet URI codec (spec §4.2).
//!
//! `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>&tr=<tracker>&x.pe=<ip>&ws=<url>`
//!
//! `xt` is required and carries the info-hash as either 40 hex chars or 32
//! RFC 4648 base32 chars. Everything else is optional and repeatable except
//! `dn`, which we take the first of if repeated.
use crate::ids::InfoHash;
use thiserror::Error;
use url::form_urlencoded;

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("invalid magnet URI: {0}")]
    InvalidMagnet(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub peer_addresses: Vec<String>,
    pub web_seeds: Vec<String>,
}

const PREFIX: &str = "magnet:?";

pub fn parse(uri: &str) -> Result<MagnetLink, MagnetError> {
    let query = uri
        .strip_prefix(PREFIX)
        .ok_or_else(|| MagnetError::InvalidMagnet("missing 'magnet:?' prefix".to_string()))?;

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();
    let mut peer_addresses = Vec::new();
    let mut web_seeds = Vec::new();

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "xt" => {
                let hash_str = value
                    .strip_prefix("urn:btih:")
                    .ok_or_else(|| MagnetError::InvalidMagnet(format!("unsupported xt '{value}'")))?;
                info_hash = Some(decode_info_hash(hash_str)?);
            }
            "dn" => {
                if display_name.is_none() {
                    display_name = Some(value.into_owned());
                }
            }
            "tr" => trackers.push(value.into_owned()),
            "x.pe" => peer_addresses.push(value.into_owned()),
            "ws" => web_seeds.push(value.into_owned()),
            _ => {}
        }
    }

    let info_hash = info_hash.ok_or_else(|| MagnetError::InvalidMagnet("missing xt=urn:btih:...".to_string()))?;

    Ok(MagnetLink {
        info_hash,
        display_name,
        trackers,
        peer_addresses,
        web_seeds,
    })
}

pub fn create(link: &MagnetLink) -> String {
    let mut out = String::from(PREFIX);
    out.push_str("xt=urn:btih:");
    out.push_str(&link.info_hash.to_hex());

    if let Some(name) = &link.display_name {
        out.push_str("&dn=");
        out.push_str(&form_urlencoded::byte_serialize(name.as_bytes()).collect::<String>());
    }
    for tracker in &link.trackers {
        out.push_str("&tr=");
        out.push_str(&form_urlencoded::byte_serialize(tracker.as_bytes()).collect::<String>());
    }
    for pe in &link.peer_addresses {
        out.push_str("&x.pe=");
        out.push_str(&form_urlencoded::byte_serialize(pe.as_bytes()).collect::<String>());
    }
    for ws in &link.web_seeds {
        out.push_str("&ws=");
        out.push_str(&form_urlencoded::byte_serialize(ws.as_bytes()).collect::<String>());
    }
    out
}

fn decode_info_hash(s: &str) -> Result<InfoHash, MagnetError> {
    match s.len() {
        40 => InfoHash::from_hex(&s.to_lowercase())
            .map_err(|e| MagnetError::InvalidMagnet(format!("bad hex info-hash: {e}"))),
        32 => {
            let bytes = base32_decode(s)
                .ok_or_else(|| MagnetError::InvalidMagnet("bad base32 info-hash".to_string()))?;
            InfoHash::from_slice(&bytes)
                .ok_or_else(|| MagnetError::InvalidMagnet("base32 info-hash wrong length".to_string()))
        }
        other => Err(MagnetError::InvalidMagnet(format!(
            "info-hash must be 40 hex or 32 base32 chars, got {other}"
        ))),
    }
}

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32 decode (case-insensitive, no padding), used only for the
/// 32-char info-hash form magnet links carry.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);

    for c in input.chars() {
        let upper = c.to_ascii_uppercase();
        let value = BASE32_ALPHABET.iter().position(|&b| b as char == upper)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    Some(out)
}

#[allow(dead_code)]
fn base32_encode(data: &[u8]) -> String {
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));

    for &byte in data {
        bits = (bits << 8) | byte as u64;
        bit_count += 8;
        while bit_count >= 5 {
            bit_count -= 5;
            let idx = ((bits >> bit_count) & 0x1F) as usize;
            out.push(BASE32_ALPHABET[idx] as char);
        }
    }
    if bit_count > 0 {
        let idx = ((bits << (5 - bit_count)) & 0x1F) as usize;
        out.push(BASE32_ALPHABET[idx] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> InfoHash {
        InfoHash::from_hex("0123456789abcdef0123456789abcdef01234567").unwrap()
    }

    #[test]
    fn round_trips_hex() {
        let link = MagnetLink {
            info_hash: sample_hash(),
            display_name: Some("My Torrent".to_string()),
            trackers: vec!["http://tracker.example/a".to_string(), "udp://tracker2.example:80".to_string()],
            peer_addresses: vec![],
            web_seeds: vec!["http://seed.example/file".to_string()],
        };
        let uri = create(&link);
        let parsed = parse(&uri).unwrap();
        assert_eq!(parsed, link);
    }

    #[test]
    fn parses_base32_info_hash() {
        let hash = sample_hash();
        let b32 = base32_encode(hash.as_bytes());
        assert_eq!(b32.len(), 32);
        let uri = format!("magnet:?xt=urn:btih:{b32}");
        let parsed = parse(&uri).unwrap();
        assert_eq!(parsed.info_hash, hash);
    }

    #[test]
    fn normalizes_hash_case_to_lowercase() {
        let uri = "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567";
        let parsed = parse(uri).unwrap();
        assert_eq!(parsed.info_hash.to_hex(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(parse("magnet:?dn=foo").is_err());
    }

    #[test]
    fn rejects_bad_hash_length() {
        assert!(parse("magnet:?xt=urn:btih:deadbeef").is_err());
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(parse("xt=urn:btih:deadbeef").is_err());
    }
}
