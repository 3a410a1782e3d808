//! The DHT node: UDP transport, pending-transaction bookkeeping, peer
//! storage, and the iterative `find_node`/`get_peers` lookup (spec §4.7).
use super::krpc::{self, KrpcError2, Message, Query, Response, Txn};
use super::routing_table::{AddNodeOutcome, Contact, RoutingTable};
use super::token::TokenManager;
use crate::ids::{InfoHash, NodeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub const ALPHA: usize = 3;
pub const K: usize = 8;
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LOOKUP_ROUNDS: usize = 8;
const PEER_ENTRY_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum DhtError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Krpc(#[from] krpc::KrpcError),
    #[error("query timed out")]
    Timeout,
    #[error("remote returned an error: {0:?}")]
    Remote(KrpcError2),
    #[error("unexpected response shape for this query")]
    UnexpectedResponse,
}

struct StoredPeer {
    addr: SocketAddr,
    first_seen: Instant,
}

/// A DHT node bound to one UDP socket. Cheaply `Clone`-able: the socket and
/// mutable state are behind `Arc`, so the background receive loop and
/// lookup callers share one instance (grounded in the tracker client's
/// `Arc`-free-but-async-method style, generalised here because the DHT
/// needs concurrent readers/writers the tracker client does not).
#[derive(Clone)]
pub struct DhtNode {
    socket: std::sync::Arc<UdpSocket>,
    our_id: NodeId,
    routing_table: std::sync::Arc<Mutex<RoutingTable>>,
    tokens: std::sync::Arc<Mutex<TokenManager>>,
    peer_store: std::sync::Arc<Mutex<HashMap<InfoHash, Vec<StoredPeer>>>>,
    pending: std::sync::Arc<Mutex<HashMap<Txn, oneshot::Sender<Result<Response, KrpcError2>>>>>,
    next_txn: std::sync::Arc<std::sync::atomic::AtomicU16>,
}

impl DhtNode {
    pub async fn bind(addr: SocketAddr, our_id: NodeId) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        let node = Self {
            socket: std::sync::Arc::new(socket),
            our_id,
            routing_table: std::sync::Arc::new(Mutex::new(RoutingTable::new(our_id))),
            tokens: std::sync::Arc::new(Mutex::new(TokenManager::new())),
            peer_store: std::sync::Arc::new(Mutex::new(HashMap::new())),
            pending: std::sync::Arc::new(Mutex::new(HashMap::new())),
            next_txn: std::sync::Arc::new(std::sync::atomic::AtomicU16::new(0)),
        };
        node.clone().spawn_receive_loop();
        Ok(node)
    }

    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    fn next_txn(&self) -> Txn {
        let n = self.next_txn.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        n.to_be_bytes()
    }

    fn spawn_receive_loop(self) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let (len, from) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(%err, "dht socket recv failed");
                        continue;
                    }
                };
                self.handle_packet(&buf[..len], from).await;
            }
        });
    }

    async fn handle_packet(&self, bytes: &[u8], from: SocketAddr) {
        let message = match Message::decode(bytes) {
            Ok(m) => m,
            Err(err) => {
                debug!(%from, %err, "malformed KRPC packet");
                return;
            }
        };
        match message {
            Message::Query { txn, query } => self.handle_query(txn, query, from).await,
            Message::Response { txn, response } => self.complete_pending(txn, Ok(response)).await,
            Message::Error { txn, error } => self.complete_pending(txn, Err(error)).await,
        }
    }

    async fn complete_pending(&self, txn: Txn, result: Result<Response, KrpcError2>) {
        if let Some(sender) = self.pending.lock().await.remove(&txn) {
            let _ = sender.send(result);
        }
    }

    #[instrument(skip(self))]
    async fn handle_query(&self, txn: Txn, query: Query, from: SocketAddr) {
        self.note_contact_from_query(&query, from).await;
        let response = match query {
            Query::Ping { .. } => Response::IdOnly { id: self.our_id },
            Query::FindNode { target, .. } => {
                let table = self.routing_table.lock().await;
                Response::FindNode { id: self.our_id, nodes: table.closest(&target, K) }
            }
            Query::GetPeers { info_hash, .. } => {
                let mut tokens = self.tokens.lock().await;
                tokens.rotate_if_due();
                let token = tokens.issue(from.ip()).to_vec();
                drop(tokens);
                let store = self.peer_store.lock().await;
                if let Some(peers) = store.get(&info_hash).filter(|p| !p.is_empty()) {
                    Response::GetPeersWithValues {
                        id: self.our_id,
                        token,
                        peers: peers.iter().map(|p| p.addr).collect(),
                    }
                } else {
                    let table = self.routing_table.lock().await;
                    Response::GetPeersWithNodes { id: self.our_id, token, nodes: table.closest(&info_hash_as_node(&info_hash), K) }
                }
            }
            Query::AnnouncePeer { info_hash, port, token, implied_port, .. } => {
                let tokens = self.tokens.lock().await;
                let valid = tokens.validate(from.ip(), &token);
                drop(tokens);
                if valid {
                    let announced_port = if implied_port { from.port() } else { port };
                    let addr = SocketAddr::new(from.ip(), announced_port);
                    let mut store = self.peer_store.lock().await;
                    let entries = store.entry(info_hash).or_default();
                    if let Some(existing) = entries.iter_mut().find(|p| p.addr == addr) {
                        existing.first_seen = Instant::now();
                    } else {
                        entries.push(StoredPeer { addr, first_seen: Instant::now() });
                    }
                }
                Response::IdOnly { id: self.our_id }
            }
        };
        let msg = Message::Response { txn, response };
        let _ = self.socket.send_to(&msg.encode(), from).await;
    }

    async fn note_contact_from_query(&self, query: &Query, from: SocketAddr) {
        let id = match query {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => *id,
        };
        let mut table = self.routing_table.lock().await;
        table.add_node(Contact { id, addr: from });
    }

    /// Sends a query and awaits its matching response, honouring the
    /// query/ping timeouts from spec §4.7.
    async fn send_query(&self, addr: SocketAddr, query: Query, budget: Duration) -> Result<Response, DhtError> {
        let txn = self.next_txn();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(txn, tx);
        let msg = Message::Query { txn, query };
        self.socket.send_to(&msg.encode(), addr).await?;
        match timeout(budget, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(err))) => Err(DhtError::Remote(err)),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().await.remove(&txn);
                Err(DhtError::Timeout)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        let response = self.send_query(addr, Query::Ping { id: self.our_id }, PING_TIMEOUT).await?;
        match response {
            Response::IdOnly { id } => Ok(id),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    /// Bootstraps the routing table by querying `find_node(our_id)` against
    /// each configured bootstrap contact; ready on first response (spec
    /// §4.7).
    #[instrument(skip(self, bootstrap_contacts))]
    pub async fn bootstrap(&self, bootstrap_contacts: &[SocketAddr]) -> bool {
        for &addr in bootstrap_contacts {
            let query = Query::FindNode { id: self.our_id, target: self.our_id };
            if let Ok(Response::FindNode { nodes, .. }) = self.send_query(addr, query, QUERY_TIMEOUT).await {
                let mut table = self.routing_table.lock().await;
                for node in nodes {
                    table.add_node(node);
                }
                return true;
            }
        }
        false
    }

    /// Iterative `find_node` lookup (spec §4.7): queries α closest
    /// unqueried contacts per round until the k closest seen contain no
    /// unqueried contact or `MAX_LOOKUP_ROUNDS` is reached.
    pub async fn lookup_nodes(&self, target: NodeId) -> Vec<Contact> {
        self.iterative_lookup(target, None).await.0
    }

    /// `get_peers` lookup: same iterative shortlist expansion, but
    /// terminates early when a response carries peer values, and then
    /// announces to every node that returned a token (spec §4.7).
    pub async fn get_peers(&self, info_hash: InfoHash, our_port: u16) -> Vec<SocketAddr> {
        let target = info_hash_as_node(&info_hash);
        let (_, outcome) = self.iterative_lookup(target, Some(info_hash)).await;
        let GetPeersOutcome { peers, tokened_nodes } = outcome.unwrap_or_default();
        for (contact, token) in tokened_nodes {
            let query = Query::AnnouncePeer {
                id: self.our_id,
                info_hash,
                port: our_port,
                token,
                implied_port: false,
            };
            let _ = self.send_query(contact.addr, query, QUERY_TIMEOUT).await;
        }
        peers
    }

    async fn iterative_lookup(
        &self,
        target: NodeId,
        info_hash: Option<InfoHash>,
    ) -> (Vec<Contact>, Option<GetPeersOutcome>) {
        let mut queried = std::collections::HashSet::new();
        let mut shortlist: Vec<Contact> = {
            let table = self.routing_table.lock().await;
            table.closest(&target, K)
        };
        let mut outcome = GetPeersOutcome::default();
        let mut found_values = false;

        for _round in 0..MAX_LOOKUP_ROUNDS {
            shortlist.sort_by_key(|c| c.id.distance(&target));
            shortlist.truncate(K.max(ALPHA * 4));
            let to_query: Vec<Contact> =
                shortlist.iter().filter(|c| !queried.contains(&c.id)).take(ALPHA).copied().collect();
            if to_query.is_empty() {
                break;
            }

            for contact in to_query {
                queried.insert(contact.id);
                let query = match info_hash {
                    Some(hash) => Query::GetPeers { id: self.our_id, info_hash: hash },
                    None => Query::FindNode { id: self.our_id, target },
                };
                let response = self.send_query(contact.addr, query, QUERY_TIMEOUT).await;
                match response {
                    Ok(Response::FindNode { nodes, .. }) => {
                        self.merge_nodes(&mut shortlist, nodes).await;
                    }
                    Ok(Response::GetPeersWithNodes { nodes, token, .. }) => {
                        outcome.tokened_nodes.push((contact, token));
                        self.merge_nodes(&mut shortlist, nodes).await;
                    }
                    Ok(Response::GetPeersWithValues { peers, token, .. }) => {
                        outcome.tokened_nodes.push((contact, token));
                        outcome.peers.extend(peers);
                        found_values = true;
                    }
                    Ok(Response::IdOnly { .. }) | Err(_) => {}
                }
            }

            if found_values && info_hash.is_some() {
                break;
            }
        }

        (shortlist, Some(outcome))
    }

    async fn merge_nodes(&self, shortlist: &mut Vec<Contact>, nodes: Vec<Contact>) {
        let mut table = self.routing_table.lock().await;
        for node in nodes {
            if node.id == self.our_id {
                continue;
            }
            if let AddNodeOutcome::BucketFull = table.add_node(node) {
                if let Some(oldest) = table.oldest_in_bucket_of(&node.id) {
                    drop(table);
                    let alive = timeout(PING_TIMEOUT, self.ping(oldest.addr)).await.is_ok();
                    table = self.routing_table.lock().await;
                    if !alive {
                        table.evict_oldest(&node.id);
                        table.add_node(node);
                    }
                }
            }
            if !shortlist.iter().any(|c| c.id == node.id) {
                shortlist.push(node);
            }
        }
    }

    /// Drops peer entries older than [`PEER_ENTRY_TTL`]; run periodically
    /// alongside bucket refresh.
    pub async fn expire_peers(&self) {
        let now = Instant::now();
        let mut store = self.peer_store.lock().await;
        for entries in store.values_mut() {
            entries.retain(|p| now.duration_since(p.first_seen) < PEER_ENTRY_TTL);
        }
        store.retain(|_, entries| !entries.is_empty());
    }

    pub async fn routing_table_len(&self) -> usize {
        self.routing_table.lock().await.len()
    }
}

#[derive(Default)]
struct GetPeersOutcome {
    peers: Vec<SocketAddr>,
    tokened_nodes: Vec<(Contact, Vec<u8>)>,
}

fn info_hash_as_node(info_hash: &InfoHash) -> NodeId {
    NodeId::from_bytes(*info_hash.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_round_trip_between_two_local_nodes() {
        let a = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        let b = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        let replied_id = a.ping(b_addr).await.unwrap();
        assert_eq!(replied_id, b.our_id());
    }

    #[tokio::test]
    async fn bootstrap_populates_routing_table() {
        let a = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        let b = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        assert!(a.bootstrap(&[b_addr]).await);
    }

    #[tokio::test]
    async fn announce_then_get_peers_round_trip() {
        let a = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        let b = DhtNode::bind("127.0.0.1:0".parse().unwrap(), NodeId::random()).await.unwrap();
        let a_addr = a.socket.local_addr().unwrap();
        let info_hash = InfoHash::random();

        let tokens = b.tokens.lock().await;
        let token = tokens.issue(a_addr.ip()).to_vec();
        drop(tokens);
        let query = Query::AnnouncePeer {
            id: a.our_id(),
            info_hash,
            port: 6881,
            token,
            implied_port: true,
        };
        let response = a.send_query(b.socket.local_addr().unwrap(), query, QUERY_TIMEOUT).await.unwrap();
        assert!(matches!(response, Response::IdOnly { .. }));

        let store = b.peer_store.lock().await;
        assert!(store.contains_key(&info_hash));
    }
}
