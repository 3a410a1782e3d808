//! UDP tracker announce (BEP 15): connect handshake then announce, each
//! retried with the protocol's `15 * 2^n` backoff up to 8 tries (spec §4.8).
use super::{AnnounceEvent, AnnounceParams, AnnounceResponse, Peer, TrackerError};
use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const MAX_TRIES: u32 = 8;

fn retry_delay(n: u32) -> Duration {
    Duration::from_secs(15u64.saturating_mul(1u64 << n.min(10)))
}

async fn send_with_retries(socket: &UdpSocket, packet: &[u8], min_reply_len: usize) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];
    for attempt in 0..MAX_TRIES {
        socket.send(packet).await?;
        let budget = retry_delay(attempt);
        match timeout(budget, socket.recv(&mut buf)).await {
            Ok(Ok(len)) if len >= min_reply_len => return Ok(buf[..len].to_vec()),
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => return Err(TrackerError::Io(err)),
            Err(_) => continue,
        }
    }
    Err(TrackerError::Timeout)
}

async fn connect(socket: &UdpSocket) -> Result<u64, TrackerError> {
    let txn_id = rand::rng().next_u32();
    let mut packet = [0u8; 16];
    BigEndian::write_u64(&mut packet[0..8], PROTOCOL_MAGIC);
    BigEndian::write_u32(&mut packet[8..12], ACTION_CONNECT);
    BigEndian::write_u32(&mut packet[12..16], txn_id);

    let reply = send_with_retries(socket, &packet, 16).await?;
    let action = BigEndian::read_u32(&reply[0..4]);
    let reply_txn = BigEndian::read_u32(&reply[4..8]);
    if action != ACTION_CONNECT || reply_txn != txn_id {
        return Err(TrackerError::Decode("unexpected connect reply".to_string()));
    }
    Ok(BigEndian::read_u64(&reply[8..16]))
}

fn event_code(event: AnnounceEvent) -> u32 {
    match event {
        AnnounceEvent::Empty => 0,
        AnnounceEvent::Completed => 1,
        AnnounceEvent::Started => 2,
        AnnounceEvent::Stopped => 3,
    }
}

pub async fn announce(tracker_addr: SocketAddr, params: &AnnounceParams) -> Result<AnnounceResponse, TrackerError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(tracker_addr).await?;

    let connection_id = connect(&socket).await?;
    let txn_id = rand::rng().next_u32();

    let mut packet = [0u8; 98];
    BigEndian::write_u64(&mut packet[0..8], connection_id);
    BigEndian::write_u32(&mut packet[8..12], ACTION_ANNOUNCE);
    BigEndian::write_u32(&mut packet[12..16], txn_id);
    packet[16..36].copy_from_slice(params.info_hash.as_bytes());
    packet[36..56].copy_from_slice(params.peer_id.as_bytes());
    BigEndian::write_u64(&mut packet[56..64], params.downloaded);
    BigEndian::write_u64(&mut packet[64..72], params.left);
    BigEndian::write_u64(&mut packet[72..80], params.uploaded);
    BigEndian::write_u32(&mut packet[80..84], event_code(params.event));
    // ip_address = 0 (let tracker use source), key = random, num_want = -1 (default), port.
    BigEndian::write_u32(&mut packet[84..88], 0);
    BigEndian::write_u32(&mut packet[88..92], rand::rng().next_u32());
    BigEndian::write_i32(&mut packet[92..96], -1);
    BigEndian::write_u16(&mut packet[96..98], params.port);

    let reply = send_with_retries(&socket, &packet, 20).await?;
    let action = BigEndian::read_u32(&reply[0..4]);
    let reply_txn = BigEndian::read_u32(&reply[4..8]);
    if action != ACTION_ANNOUNCE || reply_txn != txn_id {
        return Err(TrackerError::Decode("unexpected announce reply".to_string()));
    }
    let interval = BigEndian::read_u32(&reply[8..12]) as u64;
    let peers = reply[20..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = BigEndian::read_u16(&chunk[4..6]);
            Peer { addr: SocketAddr::new(IpAddr::V4(ip), port) }
        })
        .collect();

    Ok(AnnounceResponse { interval, peers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_follows_15_times_2_to_the_n() {
        assert_eq!(retry_delay(0), Duration::from_secs(15));
        assert_eq!(retry_delay(1), Duration::from_secs(30));
        assert_eq!(retry_delay(3), Duration::from_secs(120));
    }

    #[test]
    fn event_codes_match_bep15() {
        assert_eq!(event_code(AnnounceEvent::Empty), 0);
        assert_eq!(event_code(AnnounceEvent::Completed), 1);
        assert_eq!(event_code(AnnounceEvent::Started), 2);
        assert_eq!(event_code(AnnounceEvent::Stopped), 3);
    }
}
