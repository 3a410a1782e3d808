//! HTTP tracker announce: URL-encoded GET request, bencoded response (spec
//! §4.8). Grounded on the teacher's `tracker::Client`, generalized from a
//! single hardcoded `TorrentFile` parameter to the explicit announce
//! parameters every tracker scheme (HTTP and UDP) shares.
use super::{AnnounceEvent, AnnounceParams, AnnounceResponse, Peer, TrackerError};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: WirePeers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WirePeers {
    Compact(Vec<u8>),
    NonCompact(Vec<WirePeerDict>),
}

impl Default for WirePeers {
    fn default() -> Self {
        WirePeers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct WirePeerDict {
    ip: String,
    port: u16,
}

fn event_name(event: AnnounceEvent) -> Option<&'static str> {
    match event {
        AnnounceEvent::Started => Some("started"),
        AnnounceEvent::Completed => Some("completed"),
        AnnounceEvent::Stopped => Some("stopped"),
        AnnounceEvent::Empty => None,
    }
}

/// Percent-encodes bytes per RFC 3986, leaving unreserved characters as-is.
/// `info_hash`/`peer_id` are raw 20-byte strings that must travel through
/// the query string unescaped-where-possible (the teacher's `url_encode`,
/// kept verbatim since it already matches the wire requirement exactly).
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

pub async fn announce(announce_url: &str, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
    let mut url = url::Url::parse(announce_url)?;
    let mut pairs = vec![
        ("info_hash", url_encode(params.info_hash.as_bytes())),
        ("peer_id", url_encode(params.peer_id.as_bytes())),
        ("port", params.port.to_string()),
        ("uploaded", params.uploaded.to_string()),
        ("downloaded", params.downloaded.to_string()),
        ("left", params.left.to_string()),
        ("compact", "1".to_string()),
    ];
    if let Some(name) = event_name(params.event) {
        pairs.push(("event", name.to_string()));
    }
    url.query_pairs_mut().extend_pairs(&pairs).finish();

    tracing::debug!(%url, "announcing to HTTP tracker");
    let response = reqwest::get(url).await?;
    let bytes = response.bytes().await?;
    parse_response(&bytes)
}

fn parse_response(bytes: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let wire: WireResponse = serde_bencode::from_bytes(bytes).map_err(|e| TrackerError::Decode(e.to_string()))?;
    if let Some(reason) = wire.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    let peers = match wire.peers {
        WirePeers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer { addr: std::net::SocketAddr::new(IpAddr::V4(ip), port) }
            })
            .collect(),
        WirePeers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| dict.ip.parse::<IpAddr>().ok().map(|ip| Peer { addr: std::net::SocketAddr::new(ip, dict.port) }))
            .collect(),
    };

    Ok(AnnounceResponse { interval: wire.interval.max(0) as u64, peers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers() {
        let body = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x7f\x00\x00\x02\x1a\xe2e";
        let response = parse_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].addr.port(), 6881);
    }

    #[test]
    fn parses_failure_reason() {
        let body = b"d14:failure reason18:bad info_hash abce";
        assert!(matches!(parse_response(body), Err(TrackerError::Failure(_))));
    }

    #[test]
    fn url_encode_matches_rfc3986_unreserved_set() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
        assert_eq!(url_encode(&[0xffu8]), "%FF");
    }
}
