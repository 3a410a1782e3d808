//! Peer pool, connection caps, health/bans, and reconnection (spec §4.11).
//!
//! Owns every [`PeerConnection`](super::connection) for one torrent.
//! Callers never see raw connection ids crossing into another torrent's
//! manager; a `PeerManager` is per-torrent, matching the one-way ownership
//! spec §9 asks for (Torrent owns PeerManager owns PeerConnections).
use super::connection::{self, ConnId, PeerCommand, PeerEvent};
use super::health::{PeerHealth, StrikeCause};
use crate::ids::{InfoHash, PeerId};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

const DEFAULT_MAX_CONNECTIONS: usize = 50;
const DEFAULT_MAX_PER_SOURCE_IP: usize = 3;
const INTER_DIAL_DELAY: Duration = Duration::from_millis(100);
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

struct ConnectedPeer {
    addr: SocketAddr,
    tx_commands: mpsc::Sender<PeerCommand>,
    health: PeerHealth,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

/// A tagged event: which connection it came from, plus what happened.
pub struct TaggedEvent {
    pub conn_id: ConnId,
    pub event: PeerEvent,
}

pub struct PeerManager {
    info_hash: InfoHash,
    our_peer_id: PeerId,
    max_connections: usize,
    max_per_source_ip: usize,
    pool: HashSet<SocketAddr>,
    connected: HashMap<SocketAddr, ConnId>,
    connections: HashMap<ConnId, ConnectedPeer>,
    per_ip_counts: HashMap<IpAddr, usize>,
    next_conn_id: ConnId,
    events_tx: mpsc::Sender<TaggedEvent>,
}

impl PeerManager {
    pub fn new(info_hash: InfoHash, our_peer_id: PeerId) -> (Self, mpsc::Receiver<TaggedEvent>) {
        Self::with_caps(info_hash, our_peer_id, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PER_SOURCE_IP)
    }

    pub fn with_caps(
        info_hash: InfoHash,
        our_peer_id: PeerId,
        max_connections: usize,
        max_per_source_ip: usize,
    ) -> (Self, mpsc::Receiver<TaggedEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let manager = Self {
            info_hash,
            our_peer_id,
            max_connections,
            max_per_source_ip,
            pool: HashSet::new(),
            connected: HashMap::new(),
            connections: HashMap::new(),
            per_ip_counts: HashMap::new(),
            next_conn_id: 0,
            events_tx,
        };
        (manager, events_rx)
    }

    /// Adds newly discovered addresses, de-duplicating against both the
    /// pool and the connected set (spec §4.11).
    pub fn add_peers(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            if !self.connected.contains_key(&addr) {
                self.pool.insert(addr);
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn addr_of(&self, conn_id: ConnId) -> Option<SocketAddr> {
        self.connections.get(&conn_id).map(|p| p.addr)
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.connections.keys().copied()
    }

    pub fn is_peer_interested(&self, conn_id: ConnId) -> bool {
        self.connections.get(&conn_id).is_some_and(|p| p.peer_interested)
    }

    pub fn is_am_choking(&self, conn_id: ConnId) -> bool {
        self.connections.get(&conn_id).is_none_or(|p| p.am_choking)
    }

    /// Dials up to `n` peers from the pool, skipping any that would exceed
    /// the total or per-source-IP cap, pacing dials 100ms apart.
    #[instrument(skip(self))]
    pub async fn connect_batch(&mut self, n: usize) {
        let mut candidates: Vec<SocketAddr> = self.pool.iter().copied().collect();
        candidates.truncate(n.saturating_mul(4).max(n));
        let mut dialed = 0;
        for addr in candidates {
            if dialed >= n || self.connected.len() >= self.max_connections {
                break;
            }
            let ip_count = self.per_ip_counts.get(&addr.ip()).copied().unwrap_or(0);
            if ip_count >= self.max_per_source_ip {
                continue;
            }
            self.pool.remove(&addr);
            self.dial(addr).await;
            dialed += 1;
            if dialed < n {
                sleep(INTER_DIAL_DELAY).await;
            }
        }
    }

    async fn dial(&mut self, addr: SocketAddr) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let info_hash = self.info_hash;
        let our_peer_id = self.our_peer_id;
        let events_tx = self.events_tx.clone();
        let (tx_commands, rx_commands) = mpsc::channel(64);

        self.connected.insert(addr, conn_id);
        *self.per_ip_counts.entry(addr.ip()).or_insert(0) += 1;
        self.connections.insert(
            conn_id,
            ConnectedPeer {
                addr,
                tx_commands,
                health: PeerHealth::new(),
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
            },
        );

        tokio::spawn(async move {
            match connection::dial_and_handshake(addr, info_hash, our_peer_id).await {
                Ok((stream, handshake)) => {
                    let _ = events_tx
                        .send(TaggedEvent {
                            conn_id,
                            event: PeerEvent::Established {
                                remote_peer_id: handshake.peer_id,
                                extensions_supported: handshake.supports_extensions(),
                            },
                        })
                        .await;
                    let (tx_events, mut rx_events) = mpsc::channel(64);
                    let forward = tokio::spawn(async move {
                        while let Some(event) = rx_events.recv().await {
                            if events_tx.send(TaggedEvent { conn_id, event }).await.is_err() {
                                break;
                            }
                        }
                    });
                    connection::run(conn_id, stream, tx_events, rx_commands).await;
                    let _ = forward.await;
                }
                Err(err) => {
                    debug!(conn_id, %addr, %err, "dial failed");
                    let _ = events_tx
                        .send(TaggedEvent {
                            conn_id,
                            event: PeerEvent::Disconnected { reason: err.to_string() },
                        })
                        .await;
                }
            }
        });
    }

    /// Registers an already-handshaken inbound connection (the listener
    /// accepted it, read the remote's handshake, and replied) under a fresh
    /// `ConnId`, mirroring [`Self::dial`] minus the handshake step. The
    /// caller is responsible for feeding the corresponding `Established`
    /// event back through the torrent's event handling.
    pub fn adopt_inbound(&mut self, addr: SocketAddr, stream: TcpStream) -> ConnId {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let events_tx = self.events_tx.clone();
        let (tx_commands, rx_commands) = mpsc::channel(64);

        self.connected.insert(addr, conn_id);
        *self.per_ip_counts.entry(addr.ip()).or_insert(0) += 1;
        self.connections.insert(
            conn_id,
            ConnectedPeer {
                addr,
                tx_commands,
                health: PeerHealth::new(),
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
            },
        );

        tokio::spawn(async move {
            let (tx_events, mut rx_events) = mpsc::channel(64);
            let forward = tokio::spawn(async move {
                while let Some(event) = rx_events.recv().await {
                    if events_tx.send(TaggedEvent { conn_id, event }).await.is_err() {
                        break;
                    }
                }
            });
            connection::run(conn_id, stream, tx_events, rx_commands).await;
            let _ = forward.await;
        });
        conn_id
    }

    pub fn send(&self, conn_id: ConnId, command: PeerCommand) {
        if let Some(peer) = self.connections.get(&conn_id) {
            let tx = peer.tx_commands.clone();
            tokio::spawn(async move {
                let _ = tx.send(command).await;
            });
        }
    }

    pub fn set_am_choking(&mut self, conn_id: ConnId, choking: bool) {
        if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.am_choking = choking;
        }
    }

    pub fn set_am_interested(&mut self, conn_id: ConnId, interested: bool) {
        if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.am_interested = interested;
        }
    }

    pub fn note_peer_choking(&mut self, conn_id: ConnId, choking: bool) {
        if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.peer_choking = choking;
        }
    }

    pub fn note_peer_interested(&mut self, conn_id: ConnId, interested: bool) {
        if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.peer_interested = interested;
        }
    }

    pub fn record_success(&mut self, conn_id: ConnId, rtt: Duration) {
        if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.health.record_success(rtt);
        }
    }

    pub fn record_failure(&mut self, conn_id: ConnId) {
        if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.health.record_failure();
        }
    }

    /// Records a strike against a peer; on the third strike the peer is
    /// banned and disconnected (spec §4.11).
    #[instrument(skip(self))]
    pub fn strike(&mut self, conn_id: ConnId, cause: StrikeCause) {
        let now = Instant::now();
        let banned = if let Some(peer) = self.connections.get_mut(&conn_id) {
            peer.health.strike(cause, now)
        } else {
            return;
        };
        if banned {
            warn!(conn_id, ?cause, "peer banned after 3 strikes");
            self.disconnect(conn_id);
        }
    }

    /// Removes all bookkeeping for a closed connection and sends it a final
    /// close command. Reconnection is the torrent's own responsibility (it
    /// tracks per-address backoff and calls [`Self::readmit`] once the delay
    /// computed by `peer::health::reconnect_delay` elapses).
    pub fn disconnect(&mut self, conn_id: ConnId) {
        let Some(peer) = self.connections.remove(&conn_id) else {
            return;
        };
        self.connected.remove(&peer.addr);
        if let Some(count) = self.per_ip_counts.get_mut(&peer.addr.ip()) {
            *count = count.saturating_sub(1);
        }
        self.send_close(&peer);
    }

    fn send_close(&self, peer: &ConnectedPeer) {
        let tx = peer.tx_commands.clone();
        tokio::spawn(async move {
            let _ = tx.send(PeerCommand::Close).await;
        });
    }

    /// Re-admits a previously disconnected address into the pool. Callers
    /// (the torrent's driving loop) invoke this after the backoff delay
    /// computed by [`health::reconnect_delay`] has elapsed.
    pub fn readmit(&mut self, addr: SocketAddr) {
        if !self.connected.contains_key(&addr) {
            self.pool.insert(addr);
        }
    }

    /// Returns connection ids that should be pruned: slow and low
    /// success-rate peers (spec §4.11, run every [`PRUNE_INTERVAL`]).
    pub fn prune_candidates(&self) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, peer)| peer.health.should_prune())
            .map(|(&conn_id, _)| conn_id)
            .collect()
    }

    pub fn prune(&mut self) {
        for conn_id in self.prune_candidates() {
            self.disconnect(conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn add_peers_deduplicates_against_pool() {
        let (mut manager, _rx) = PeerManager::new(InfoHash::random(), PeerId::generate());
        manager.add_peers([addr(1), addr(2), addr(1)]);
        assert_eq!(manager.pool_len(), 2);
    }

    #[test]
    fn add_peers_skips_already_connected() {
        let (mut manager, _rx) = PeerManager::new(InfoHash::random(), PeerId::generate());
        manager.connected.insert(addr(1), 0);
        manager.add_peers([addr(1), addr(2)]);
        assert_eq!(manager.pool_len(), 1);
        assert!(manager.pool.contains(&addr(2)));
    }

    #[test]
    fn disconnect_without_reconnect_does_not_repool() {
        let (mut manager, _rx) = PeerManager::new(InfoHash::random(), PeerId::generate());
        let (tx, _rx_cmd) = mpsc::channel(1);
        manager.connected.insert(addr(1), 7);
        manager.connections.insert(
            7,
            ConnectedPeer {
                addr: addr(1),
                tx_commands: tx,
                health: PeerHealth::new(),
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
            },
        );
        manager.disconnect(7);
        assert_eq!(manager.connected_count(), 0);
        assert_eq!(manager.pool_len(), 0);
    }
}
