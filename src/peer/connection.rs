//! One TCP session with a remote peer (spec §4.4).
//!
//! Handshake and message parsing are explicit states rather than a callback
//! chain (spec §9): [`dial_and_handshake`]/[`receive_handshake`] drive
//! `Dialing -> HandshakeSent -> HandshakeComplete`, then [`run`] is spawned
//! as a task that is `Established` until it observes `Close`/EOF/a protocol
//! error, at which point it reports `Disconnected` and the task ends
//! (`Closed`). Callers never see a raw socket: outbound intent arrives as
//! [`PeerCommand`]s on a channel, inbound activity leaves as [`PeerEvent`]s
//! on another — this is the "typed messages instead of an emitter/listener
//! callback" redesign spec §9 calls for.
use crate::ids::{InfoHash, PeerId};
use crate::wire::{read_message, write_message, Handshake, PeerMessage, WireError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument};

/// Stable small integer assigned by `PeerManager` at insertion time (spec
/// §9: peers identify themselves upstream by this, never by owning a
/// back-reference to their manager or torrent).
pub type ConnId = u64;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
const KEEPALIVE_CHECK_PERIOD: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("handshake timed out")]
    HandshakeTimeout,
}

#[derive(Debug, Clone)]
pub enum PeerCommand {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Cancel { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Extended { id: u8, payload: Bytes },
    Close,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Established { remote_peer_id: PeerId, extensions_supported: bool },
    Choked,
    Unchoked,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Extended { id: u8, payload: Bytes },
    Disconnected { reason: String },
}

/// Dial, send our handshake, and read+validate the peer's, all inside one
/// 30s budget (spec §4.4).
#[instrument(skip(our_peer_id), fields(%addr))]
pub async fn dial_and_handshake(
    addr: SocketAddr,
    info_hash: InfoHash,
    our_peer_id: PeerId,
) -> Result<(TcpStream, Handshake), ConnectionError> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await.map_err(WireError::from)?;
        let ours = Handshake::new(info_hash, our_peer_id);
        ours.write(&mut stream).await?;
        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate(&info_hash)?;
        Ok::<_, ConnectionError>((stream, theirs))
    };
    timeout(HANDSHAKE_TIMEOUT, attempt)
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
}

/// Inbound side: read the remote's handshake first (we don't know which
/// torrent they want until we see their info_hash), then the caller decides
/// whether to reply via [`respond_handshake`] or drop the connection.
pub async fn receive_handshake(stream: &mut TcpStream) -> Result<Handshake, ConnectionError> {
    timeout(HANDSHAKE_TIMEOUT, Handshake::read(stream))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
        .map_err(ConnectionError::from)
}

pub async fn respond_handshake(
    stream: &mut TcpStream,
    info_hash: InfoHash,
    our_peer_id: PeerId,
) -> Result<(), ConnectionError> {
    Handshake::new(info_hash, our_peer_id).write(stream).await?;
    Ok(())
}

/// Drives one established connection until it closes. Spawned as its own
/// task; communicates only through the two channels.
#[instrument(skip(stream, tx_events, rx_commands), fields(conn_id))]
pub async fn run(
    conn_id: ConnId,
    stream: TcpStream,
    tx_events: mpsc::Sender<PeerEvent>,
    mut rx_commands: mpsc::Receiver<PeerCommand>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut last_write = Instant::now();
    let mut keepalive_tick = tokio::time::interval(KEEPALIVE_CHECK_PERIOD);

    loop {
        tokio::select! {
            result = read_message(&mut reader) => {
                match result {
                    Ok(message) => {
                        if let Some(event) = translate_inbound(message) {
                            if tx_events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(conn_id, %err, "peer read failed, closing");
                        let _ = tx_events.send(PeerEvent::Disconnected { reason: err.to_string() }).await;
                        break;
                    }
                }
            }
            command = rx_commands.recv() => {
                match command {
                    None | Some(PeerCommand::Close) => break,
                    Some(command) => {
                        if let Err(err) = write_message(&mut writer, &translate_outbound(command)).await {
                            let _ = tx_events.send(PeerEvent::Disconnected { reason: err.to_string() }).await;
                            break;
                        }
                        last_write = Instant::now();
                    }
                }
            }
            _ = keepalive_tick.tick() => {
                if last_write.elapsed() >= KEEPALIVE_INTERVAL {
                    if write_message(&mut writer, &PeerMessage::KeepAlive).await.is_err() {
                        break;
                    }
                    last_write = Instant::now();
                }
            }
        }
    }
}

fn translate_inbound(message: PeerMessage) -> Option<PeerEvent> {
    Some(match message {
        PeerMessage::KeepAlive => return None,
        PeerMessage::Choke => PeerEvent::Choked,
        PeerMessage::Unchoke => PeerEvent::Unchoked,
        PeerMessage::Interested => PeerEvent::Interested,
        PeerMessage::NotInterested => PeerEvent::NotInterested,
        PeerMessage::Have { index } => PeerEvent::Have { index },
        PeerMessage::Bitfield(bits) => PeerEvent::Bitfield(bits),
        PeerMessage::Request { index, begin, length } => PeerEvent::Request { index, begin, length },
        PeerMessage::Piece { index, begin, block } => PeerEvent::Piece { index, begin, block },
        PeerMessage::Cancel { index, begin, length } => PeerEvent::Cancel { index, begin, length },
        PeerMessage::Port(_) => return None,
        PeerMessage::Extended { id, payload } => PeerEvent::Extended { id, payload },
    })
}

fn translate_outbound(command: PeerCommand) -> PeerMessage {
    match command {
        PeerCommand::Choke => PeerMessage::Choke,
        PeerCommand::Unchoke => PeerMessage::Unchoke,
        PeerCommand::Interested => PeerMessage::Interested,
        PeerCommand::NotInterested => PeerMessage::NotInterested,
        PeerCommand::Have(index) => PeerMessage::Have { index },
        PeerCommand::Bitfield(bits) => PeerMessage::Bitfield(bits),
        PeerCommand::Request { index, begin, length } => PeerMessage::Request { index, begin, length },
        PeerCommand::Cancel { index, begin, length } => PeerMessage::Cancel { index, begin, length },
        PeerCommand::Piece { index, begin, block } => PeerMessage::Piece { index, begin, block },
        PeerCommand::Extended { id, payload } => PeerMessage::Extended { id, payload },
        PeerCommand::Close => unreachable!("Close is handled before translation"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = InfoHash::random();
        let server_peer_id = PeerId::generate();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let theirs = receive_handshake(&mut stream).await.unwrap();
            assert_eq!(theirs.info_hash, info_hash);
            respond_handshake(&mut stream, info_hash, server_peer_id).await.unwrap();
        });

        let client_peer_id = PeerId::generate();
        let (_, theirs) = dial_and_handshake(addr, info_hash, client_peer_id).await.unwrap();
        assert_eq!(theirs.peer_id, server_peer_id);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_mismatched_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_hash = InfoHash::random();
        let client_hash = InfoHash::random();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = receive_handshake(&mut stream).await;
            let _ = respond_handshake(&mut stream, server_hash, PeerId::generate()).await;
        });

        let result = dial_and_handshake(addr, client_hash, PeerId::generate()).await;
        assert!(result.is_err());
    }
}
