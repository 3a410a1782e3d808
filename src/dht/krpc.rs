//! KRPC: the bencoded query/response/error envelope DHT nodes speak over
//! UDP (spec §4.7), plus the compact contact/peer encodings it carries.
use crate::bencode::{BencodeError, BencodeValue, Dict, DictBuilder};
use crate::dht::routing_table::Contact;
use crate::ids::{InfoHash, NodeId};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

pub const NODE_COMPACT_LEN: usize = 26;
pub const PEER_COMPACT_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum KrpcError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    #[error("missing or malformed KRPC field: {0}")]
    MalformedMessage(String),
    #[error("unknown KRPC message type {0:?}")]
    UnknownType(Vec<u8>),
    #[error("unknown KRPC query method {0:?}")]
    UnknownMethod(Vec<u8>),
    #[error("compact node list length {0} is not a multiple of {NODE_COMPACT_LEN}")]
    BadCompactNodes(usize),
    #[error("compact peer entry length {0} is not {PEER_COMPACT_LEN}")]
    BadCompactPeer(usize),
}

pub type Txn = [u8; 2];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping { id: NodeId },
    FindNode { id: NodeId, target: NodeId },
    GetPeers { id: NodeId, info_hash: InfoHash },
    AnnouncePeer { id: NodeId, info_hash: InfoHash, port: u16, token: Vec<u8>, implied_port: bool },
}

/// `ping` and `announce_peer` replies are wire-identical (`{id}` only); we
/// decode both as `IdOnly` and let the caller, which remembers what it
/// asked per transaction id, tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    IdOnly { id: NodeId },
    FindNode { id: NodeId, nodes: Vec<Contact> },
    GetPeersWithNodes { id: NodeId, token: Vec<u8>, nodes: Vec<Contact> },
    GetPeersWithValues { id: NodeId, token: Vec<u8>, peers: Vec<SocketAddr> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError2 {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query { txn: Txn, query: Query },
    Response { txn: Txn, response: Response },
    Error { txn: Txn, error: KrpcError2 },
}

pub fn encode_compact_nodes(nodes: &[Contact]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * NODE_COMPACT_LEN);
    for node in nodes {
        buf.extend_from_slice(node.id.as_bytes());
        if let SocketAddr::V4(v4) = node.addr {
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    buf
}

pub fn decode_compact_nodes(bytes: &[u8]) -> Result<Vec<Contact>, KrpcError> {
    if bytes.len() % NODE_COMPACT_LEN != 0 {
        return Err(KrpcError::BadCompactNodes(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(NODE_COMPACT_LEN)
        .map(|chunk| {
            let id = NodeId::from_slice(&chunk[0..20]).expect("chunk is 20 bytes");
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            Contact { id, addr: SocketAddr::V4(SocketAddrV4::new(ip, port)) }
        })
        .collect())
}

pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<BencodeValue> {
    peers
        .iter()
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => {
                let mut buf = Vec::with_capacity(PEER_COMPACT_LEN);
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
                Some(BencodeValue::string(buf))
            }
            SocketAddr::V6(_) => None,
        })
        .collect()
}

pub fn decode_compact_peers(list: &[BencodeValue]) -> Result<Vec<SocketAddr>, KrpcError> {
    list.iter()
        .map(|v| {
            let bytes = v.as_bytes().ok_or_else(|| KrpcError::MalformedMessage("peer entry not a string".into()))?;
            if bytes.len() != PEER_COMPACT_LEN {
                return Err(KrpcError::BadCompactPeer(bytes.len()));
            }
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        })
        .collect()
}

fn get_bytes<'a>(dict: &'a Dict, key: &str) -> Option<&'a [u8]> {
    dict.get(key.as_bytes()).and_then(BencodeValue::as_bytes)
}

fn get_id(dict: &Dict) -> Result<NodeId, KrpcError> {
    get_bytes(dict, "id")
        .and_then(NodeId::from_slice)
        .ok_or_else(|| KrpcError::MalformedMessage("missing 'id'".into()))
}

fn get_int(dict: &Dict, key: &str) -> Option<i64> {
    dict.get(key.as_bytes()).and_then(BencodeValue::as_integer)
}

impl Message {
    pub fn txn(&self) -> Txn {
        match self {
            Message::Query { txn, .. } | Message::Response { txn, .. } | Message::Error { txn, .. } => *txn,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Message::Query { txn, query } => encode_query(*txn, query),
            Message::Response { txn, response } => encode_response(*txn, response),
            Message::Error { txn, error } => encode_error(*txn, error),
        };
        crate::bencode::encode_to_vec(&value).expect("encoding an in-memory BencodeValue cannot fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KrpcError> {
        let value = crate::bencode::decode(bytes)?;
        let dict = value.as_dict().ok_or_else(|| KrpcError::MalformedMessage("top level not a dict".into()))?;
        let txn_bytes = dict
            .get(b"t".as_slice())
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| KrpcError::MalformedMessage("missing 't'".into()))?;
        let txn: Txn = [*txn_bytes.first().unwrap_or(&0), *txn_bytes.get(1).unwrap_or(&0)];
        let kind = dict
            .get(b"y".as_slice())
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| KrpcError::MalformedMessage("missing 'y'".into()))?;
        match kind {
            b"q" => decode_query(dict).map(|query| Message::Query { txn, query }),
            b"r" => decode_response(dict).map(|response| Message::Response { txn, response }),
            b"e" => decode_error(dict).map(|error| Message::Error { txn, error }),
            other => Err(KrpcError::UnknownType(other.to_vec())),
        }
    }
}

fn encode_query(txn: Txn, query: &Query) -> BencodeValue {
    let (method, args) = match query {
        Query::Ping { id } => ("ping", DictBuilder::new().insert("id", BencodeValue::string(id.as_bytes().to_vec()))),
        Query::FindNode { id, target } => (
            "find_node",
            DictBuilder::new()
                .insert("id", BencodeValue::string(id.as_bytes().to_vec()))
                .insert("target", BencodeValue::string(target.as_bytes().to_vec())),
        ),
        Query::GetPeers { id, info_hash } => (
            "get_peers",
            DictBuilder::new()
                .insert("id", BencodeValue::string(id.as_bytes().to_vec()))
                .insert("info_hash", BencodeValue::string(info_hash.as_bytes().to_vec())),
        ),
        Query::AnnouncePeer { id, info_hash, port, token, implied_port } => (
            "announce_peer",
            DictBuilder::new()
                .insert("id", BencodeValue::string(id.as_bytes().to_vec()))
                .insert("info_hash", BencodeValue::string(info_hash.as_bytes().to_vec()))
                .insert("port", BencodeValue::Integer(*port as i64))
                .insert("token", BencodeValue::string(token.clone()))
                .insert("implied_port", BencodeValue::Integer(*implied_port as i64)),
        ),
    };
    DictBuilder::new()
        .insert("t", BencodeValue::string(txn.to_vec()))
        .insert("y", BencodeValue::string(b"q".to_vec()))
        .insert("q", BencodeValue::string(method.as_bytes().to_vec()))
        .insert("a", args.build())
        .build()
}

fn decode_query(dict: &Dict) -> Result<Query, KrpcError> {
    let method = dict
        .get(b"q".as_slice())
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| KrpcError::MalformedMessage("missing 'q'".into()))?;
    let args = dict
        .get(b"a".as_slice())
        .and_then(BencodeValue::as_dict)
        .ok_or_else(|| KrpcError::MalformedMessage("missing 'a'".into()))?;
    let id = get_id(args)?;
    match method {
        b"ping" => Ok(Query::Ping { id }),
        b"find_node" => {
            let target = get_bytes(args, "target")
                .and_then(NodeId::from_slice)
                .ok_or_else(|| KrpcError::MalformedMessage("missing 'target'".into()))?;
            Ok(Query::FindNode { id, target })
        }
        b"get_peers" => {
            let info_hash = get_bytes(args, "info_hash")
                .and_then(InfoHash::from_slice)
                .ok_or_else(|| KrpcError::MalformedMessage("missing 'info_hash'".into()))?;
            Ok(Query::GetPeers { id, info_hash })
        }
        b"announce_peer" => {
            let info_hash = get_bytes(args, "info_hash")
                .and_then(InfoHash::from_slice)
                .ok_or_else(|| KrpcError::MalformedMessage("missing 'info_hash'".into()))?;
            let port = get_int(args, "port").ok_or_else(|| KrpcError::MalformedMessage("missing 'port'".into()))? as u16;
            let token = get_bytes(args, "token")
                .ok_or_else(|| KrpcError::MalformedMessage("missing 'token'".into()))?
                .to_vec();
            let implied_port = get_int(args, "implied_port").unwrap_or(0) != 0;
            Ok(Query::AnnouncePeer { id, info_hash, port, token, implied_port })
        }
        other => Err(KrpcError::UnknownMethod(other.to_vec())),
    }
}

fn encode_response(txn: Txn, response: &Response) -> BencodeValue {
    let r = match response {
        Response::IdOnly { id } => DictBuilder::new().insert("id", BencodeValue::string(id.as_bytes().to_vec())),
        Response::FindNode { id, nodes } => DictBuilder::new()
            .insert("id", BencodeValue::string(id.as_bytes().to_vec()))
            .insert("nodes", BencodeValue::string(encode_compact_nodes(nodes))),
        Response::GetPeersWithNodes { id, token, nodes } => DictBuilder::new()
            .insert("id", BencodeValue::string(id.as_bytes().to_vec()))
            .insert("token", BencodeValue::string(token.clone()))
            .insert("nodes", BencodeValue::string(encode_compact_nodes(nodes))),
        Response::GetPeersWithValues { id, token, peers } => DictBuilder::new()
            .insert("id", BencodeValue::string(id.as_bytes().to_vec()))
            .insert("token", BencodeValue::string(token.clone()))
            .insert("values", BencodeValue::List(encode_compact_peers(peers))),
    };
    DictBuilder::new()
        .insert("t", BencodeValue::string(txn.to_vec()))
        .insert("y", BencodeValue::string(b"r".to_vec()))
        .insert("r", r.build())
        .build()
}

fn decode_response(dict: &Dict) -> Result<Response, KrpcError> {
    let r = dict
        .get(b"r".as_slice())
        .and_then(BencodeValue::as_dict)
        .ok_or_else(|| KrpcError::MalformedMessage("missing 'r'".into()))?;
    let id = get_id(r)?;
    let token = get_bytes(r, "token").map(|t| t.to_vec());
    let nodes = get_bytes(r, "nodes").map(decode_compact_nodes).transpose()?;
    let values = r.get(b"values".as_slice()).and_then(BencodeValue::as_list);

    if let Some(values) = values {
        let peers = decode_compact_peers(values)?;
        let token = token.ok_or_else(|| KrpcError::MalformedMessage("get_peers values reply missing token".into()))?;
        return Ok(Response::GetPeersWithValues { id, token, peers });
    }
    if let (Some(token), Some(nodes)) = (token.clone(), nodes.clone()) {
        return Ok(Response::GetPeersWithNodes { id, token, nodes });
    }
    if let Some(nodes) = nodes {
        return Ok(Response::FindNode { id, nodes });
    }
    Ok(Response::IdOnly { id })
}

fn encode_error(txn: Txn, error: &KrpcError2) -> BencodeValue {
    DictBuilder::new()
        .insert("t", BencodeValue::string(txn.to_vec()))
        .insert("y", BencodeValue::string(b"e".to_vec()))
        .insert(
            "e",
            BencodeValue::List(vec![
                BencodeValue::Integer(error.code),
                BencodeValue::string(error.message.clone().into_bytes()),
            ]),
        )
        .build()
}

fn decode_error(dict: &Dict) -> Result<KrpcError2, KrpcError> {
    let list = dict
        .get(b"e".as_slice())
        .and_then(BencodeValue::as_list)
        .ok_or_else(|| KrpcError::MalformedMessage("missing 'e'".into()))?;
    let code = list.first().and_then(BencodeValue::as_integer).unwrap_or(0);
    let message = list.get(1).and_then(BencodeValue::as_str).unwrap_or("").to_string();
    Ok(KrpcError2 { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_query_round_trips() {
        let msg = Message::Query { txn: [1, 2], query: Query::Ping { id: NodeId::random() } };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn find_node_response_round_trips() {
        let nodes = vec![Contact { id: NodeId::random(), addr: SocketAddr::from(([1, 2, 3, 4], 6881)) }];
        let msg = Message::Response { txn: [9, 9], response: Response::FindNode { id: NodeId::random(), nodes } };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn get_peers_values_response_round_trips() {
        let peers = vec![SocketAddr::from(([127, 0, 0, 1], 6881))];
        let msg = Message::Response {
            txn: [0, 1],
            response: Response::GetPeersWithValues { id: NodeId::random(), token: vec![1, 2, 3], peers },
        };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn announce_peer_query_round_trips() {
        let msg = Message::Query {
            txn: [5, 6],
            query: Query::AnnouncePeer {
                id: NodeId::random(),
                info_hash: InfoHash::random(),
                port: 6881,
                token: vec![9, 9, 9, 9],
                implied_port: false,
            },
        };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn error_message_round_trips() {
        let msg = Message::Error { txn: [3, 3], error: KrpcError2 { code: 201, message: "Generic Error".to_string() } };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }
}
