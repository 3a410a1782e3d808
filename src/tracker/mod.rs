//! Tracker client: HTTP and UDP (BEP 15) announce, peer parsing, and the
//! non-fatal retry-with-jitter schedule for announce failures (spec §4.8).
pub mod http;
pub mod udp;

use crate::ids::{InfoHash, PeerId};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to decode tracker response: {0}")]
    Decode(String),
    #[error("tracker returned failure: {0}")]
    Failure(String),
    #[error("tracker did not respond in time")]
    Timeout,
    #[error("unsupported announce URL scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    Empty,
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub peers: Vec<Peer>,
}

const RETRY_INITIAL: Duration = Duration::from_secs(30);
const RETRY_CAP: Duration = Duration::from_secs(30 * 60);

/// Non-fatal announce failure schedule: `30s` initial, doubling, capped at
/// `30min`, with up to 30% jitter so many torrents hitting the same dead
/// tracker don't thunder-herd it (spec §4.8: "errors schedule a retry with
/// jitter").
pub fn retry_delay_with_jitter(attempt: u32) -> Duration {
    let base = RETRY_INITIAL.saturating_mul(1u32 << attempt.min(10)).min(RETRY_CAP);
    let jitter_frac: f64 = rand::rng().random_range(0.0..0.3);
    base + Duration::from_secs_f64(base.as_secs_f64() * jitter_frac)
}

/// One announce call to whichever scheme the tracker URL names.
pub async fn announce(announce_url: &str, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
    let url = url::Url::parse(announce_url)?;
    match url.scheme() {
        "http" | "https" => http::announce(announce_url, params).await,
        "udp" => {
            let host = url.host_str().ok_or_else(|| TrackerError::Decode("udp tracker URL missing host".to_string()))?;
            let port = url.port().ok_or_else(|| TrackerError::Decode("udp tracker URL missing port".to_string()))?;
            let addr = tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| TrackerError::Decode("could not resolve udp tracker host".to_string()))?;
            udp::announce(addr, params).await
        }
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let first = retry_delay_with_jitter(0);
        assert!(first >= RETRY_INITIAL && first < RETRY_INITIAL.mul_f64(1.31));
        let late = retry_delay_with_jitter(20);
        assert!(late < RETRY_CAP.mul_f64(1.31));
    }
}
