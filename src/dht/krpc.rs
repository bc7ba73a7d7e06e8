//! KRPC message encode/decode (BEP-5).
use crate::bencode::{self, BencodeError, BencodeValue};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub type NodeId = [u8; 20];

#[derive(Debug, Error)]
pub enum KrpcError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),
    #[error("malformed krpc message: {0}")]
    Malformed(String),
}

pub type KrpcResult<T> = std::result::Result<T, KrpcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl CompactNode {
    pub fn encode(&self) -> [u8; 26] {
        let mut out = [0u8; 26];
        out[..20].copy_from_slice(&self.id);
        out[20..24].copy_from_slice(&self.addr.ip().octets());
        out[24..26].copy_from_slice(&self.addr.port().to_be_bytes());
        out
    }

    pub fn decode_all(bytes: &[u8]) -> Vec<CompactNode> {
        bytes
            .chunks_exact(26)
            .map(|chunk| {
                let mut id = [0u8; 20];
                id.copy_from_slice(&chunk[..20]);
                let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
                let port = u16::from_be_bytes([chunk[24], chunk[25]]);
                CompactNode {
                    id,
                    addr: SocketAddrV4::new(ip, port),
                }
            })
            .collect()
    }
}

pub fn decode_compact_peers(list: &[BencodeValue]) -> Vec<SocketAddrV4> {
    list.iter()
        .filter_map(|v| v.as_bytes())
        .filter(|b| b.len() == 6)
        .map(|b| {
            let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            let port = u16::from_be_bytes([b[4], b[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

pub fn encode_compact_peer(addr: SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

#[derive(Debug, Clone)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

#[derive(Debug, Clone)]
pub enum Response {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        nodes: Vec<CompactNode>,
    },
    GetPeers {
        id: NodeId,
        token: Vec<u8>,
        nodes: Vec<CompactNode>,
        peers: Vec<SocketAddrV4>,
    },
    AnnouncePeer {
        id: NodeId,
    },
}

#[derive(Debug, Clone)]
pub enum Message {
    Query { transaction: Vec<u8>, query: Query },
    Response { transaction: Vec<u8>, response: Response },
    Error { transaction: Vec<u8>, code: i64, message: String },
}

fn bytes(key: &'static str, v: Vec<u8>) -> (Vec<u8>, BencodeValue) {
    (key.as_bytes().to_vec(), BencodeValue::Bytes(v))
}

fn node_id_field(dict: &BTreeMap<Vec<u8>, BencodeValue>, key: &str) -> KrpcResult<NodeId> {
    let raw = dict
        .get(key.as_bytes())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| KrpcError::Malformed(format!("missing {key}")))?;
    if raw.len() != 20 {
        return Err(KrpcError::Malformed(format!("{key} must be 20 bytes")));
    }
    let mut id = [0u8; 20];
    id.copy_from_slice(raw);
    Ok(id)
}

pub fn encode_message(msg: &Message) -> KrpcResult<Vec<u8>> {
    let mut top = BTreeMap::new();
    match msg {
        Message::Query { transaction, query } => {
            top.insert(b"t".to_vec(), BencodeValue::Bytes(transaction.clone()));
            top.insert(b"y".to_vec(), BencodeValue::Bytes(b"q".to_vec()));
            let (name, args) = encode_query(query);
            top.insert(b"q".to_vec(), BencodeValue::Bytes(name.as_bytes().to_vec()));
            top.insert(b"a".to_vec(), BencodeValue::Dict(args));
        }
        Message::Response { transaction, response } => {
            top.insert(b"t".to_vec(), BencodeValue::Bytes(transaction.clone()));
            top.insert(b"y".to_vec(), BencodeValue::Bytes(b"r".to_vec()));
            top.insert(b"r".to_vec(), BencodeValue::Dict(encode_response(response)));
        }
        Message::Error { transaction, code, message } => {
            top.insert(b"t".to_vec(), BencodeValue::Bytes(transaction.clone()));
            top.insert(b"y".to_vec(), BencodeValue::Bytes(b"e".to_vec()));
            top.insert(
                b"e".to_vec(),
                BencodeValue::List(vec![
                    BencodeValue::Integer(*code),
                    BencodeValue::Bytes(message.as_bytes().to_vec()),
                ]),
            );
        }
    }
    Ok(bencode::encode(&BencodeValue::Dict(top))?)
}

fn encode_query(query: &Query) -> (&'static str, BTreeMap<Vec<u8>, BencodeValue>) {
    let mut args = BTreeMap::new();
    match query {
        Query::Ping { id } => {
            args.insert(bytes("id", id.to_vec()).0, BencodeValue::Bytes(id.to_vec()));
            ("ping", args)
        }
        Query::FindNode { id, target } => {
            args.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
            args.insert(b"target".to_vec(), BencodeValue::Bytes(target.to_vec()));
            ("find_node", args)
        }
        Query::GetPeers { id, info_hash } => {
            args.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
            args.insert(b"info_hash".to_vec(), BencodeValue::Bytes(info_hash.to_vec()));
            ("get_peers", args)
        }
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
            implied_port,
        } => {
            args.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
            args.insert(b"info_hash".to_vec(), BencodeValue::Bytes(info_hash.to_vec()));
            args.insert(b"port".to_vec(), BencodeValue::Integer(*port as i64));
            args.insert(b"token".to_vec(), BencodeValue::Bytes(token.clone()));
            args.insert(
                b"implied_port".to_vec(),
                BencodeValue::Integer(if *implied_port { 1 } else { 0 }),
            );
            ("announce_peer", args)
        }
    }
}

fn encode_response(response: &Response) -> BTreeMap<Vec<u8>, BencodeValue> {
    let mut dict = BTreeMap::new();
    match response {
        Response::Ping { id } => {
            dict.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
        }
        Response::FindNode { id, nodes } => {
            dict.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
            let blob: Vec<u8> = nodes.iter().flat_map(|n| n.encode()).collect();
            dict.insert(b"nodes".to_vec(), BencodeValue::Bytes(blob));
        }
        Response::GetPeers { id, token, nodes, peers } => {
            dict.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
            dict.insert(b"token".to_vec(), BencodeValue::Bytes(token.clone()));
            if !peers.is_empty() {
                let values = peers
                    .iter()
                    .map(|p| BencodeValue::Bytes(encode_compact_peer(*p)))
                    .collect();
                dict.insert(b"values".to_vec(), BencodeValue::List(values));
            } else {
                let blob: Vec<u8> = nodes.iter().flat_map(|n| n.encode()).collect();
                dict.insert(b"nodes".to_vec(), BencodeValue::Bytes(blob));
            }
        }
        Response::AnnouncePeer { id } => {
            dict.insert(b"id".to_vec(), BencodeValue::Bytes(id.to_vec()));
        }
    }
    dict
}

pub fn decode_message(bytes: &[u8]) -> KrpcResult<Message> {
    let value = bencode::decode(bytes)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| KrpcError::Malformed("top-level value is not a dict".into()))?;

    let transaction = dict
        .get(b"t".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| KrpcError::Malformed("missing t".into()))?
        .to_vec();
    let kind = dict
        .get(b"y".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| KrpcError::Malformed("missing y".into()))?;

    match kind {
        b"q" => {
            let method = dict
                .get(b"q".as_slice())
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| KrpcError::Malformed("missing q".into()))?;
            let args = dict
                .get(b"a".as_slice())
                .and_then(|v| v.as_dict())
                .ok_or_else(|| KrpcError::Malformed("missing a".into()))?;
            let query = decode_query(method, args)?;
            Ok(Message::Query { transaction, query })
        }
        b"r" => {
            let result = dict
                .get(b"r".as_slice())
                .and_then(|v| v.as_dict())
                .ok_or_else(|| KrpcError::Malformed("missing r".into()))?;
            let response = decode_response(result)?;
            Ok(Message::Response { transaction, response })
        }
        b"e" => {
            let list = dict
                .get(b"e".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| KrpcError::Malformed("missing e".into()))?;
            let code = list.first().and_then(|v| v.as_integer()).unwrap_or(0);
            let message = list
                .get(1)
                .and_then(|v| v.as_bytes())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            Ok(Message::Error { transaction, code, message })
        }
        other => Err(KrpcError::Malformed(format!(
            "unknown message kind {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn decode_query(method: &[u8], args: &BTreeMap<Vec<u8>, BencodeValue>) -> KrpcResult<Query> {
    let id = node_id_field(args, "id")?;
    match method {
        b"ping" => Ok(Query::Ping { id }),
        b"find_node" => {
            let target = node_id_field(args, "target")?;
            Ok(Query::FindNode { id, target })
        }
        b"get_peers" => {
            let info_hash = node_id_field(args, "info_hash")?;
            Ok(Query::GetPeers { id, info_hash })
        }
        b"announce_peer" => {
            let info_hash = node_id_field(args, "info_hash")?;
            let port = args
                .get(b"port".as_slice())
                .and_then(|v| v.as_integer())
                .ok_or_else(|| KrpcError::Malformed("missing port".into()))? as u16;
            let token = args
                .get(b"token".as_slice())
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| KrpcError::Malformed("missing token".into()))?
                .to_vec();
            let implied_port = args
                .get(b"implied_port".as_slice())
                .and_then(|v| v.as_integer())
                .unwrap_or(0)
                != 0;
            Ok(Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token,
                implied_port,
            })
        }
        other => Err(KrpcError::Malformed(format!(
            "unknown query method {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn decode_response(dict: &BTreeMap<Vec<u8>, BencodeValue>) -> KrpcResult<Response> {
    let id = node_id_field(dict, "id")?;
    if let Some(values) = dict.get(b"values".as_slice()).and_then(|v| v.as_list()) {
        let peers = decode_compact_peers(values);
        let token = dict
            .get(b"token".as_slice())
            .and_then(|v| v.as_bytes())
            .unwrap_or_default()
            .to_vec();
        return Ok(Response::GetPeers {
            id,
            token,
            nodes: Vec::new(),
            peers,
        });
    }
    if let Some(raw_nodes) = dict.get(b"nodes".as_slice()).and_then(|v| v.as_bytes()) {
        let nodes = CompactNode::decode_all(raw_nodes);
        if let Some(token) = dict.get(b"token".as_slice()).and_then(|v| v.as_bytes()) {
            return Ok(Response::GetPeers {
                id,
                token: token.to_vec(),
                nodes,
                peers: Vec::new(),
            });
        }
        return Ok(Response::FindNode { id, nodes });
    }
    Ok(Response::Ping { id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_query_round_trips() {
        let msg = Message::Query {
            transaction: b"aa".to_vec(),
            query: Query::Ping { id: [7u8; 20] },
        };
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        match decoded {
            Message::Query { transaction, query: Query::Ping { id } } => {
                assert_eq!(transaction, b"aa");
                assert_eq!(id, [7u8; 20]);
            }
            _ => panic!("expected ping query"),
        }
    }

    #[test]
    fn get_peers_response_with_values_round_trips() {
        let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881);
        let msg = Message::Response {
            transaction: b"bb".to_vec(),
            response: Response::GetPeers {
                id: [1u8; 20],
                token: b"tok".to_vec(),
                nodes: Vec::new(),
                peers: vec![peer],
            },
        };
        let encoded = encode_message(&msg).unwrap();
        match decode_message(&encoded).unwrap() {
            Message::Response {
                response: Response::GetPeers { peers, token, .. },
                ..
            } => {
                assert_eq!(peers, vec![peer]);
                assert_eq!(token, b"tok");
            }
            _ => panic!("expected get_peers response"),
        }
    }

    #[test]
    fn get_peers_response_with_nodes_round_trips() {
        let node = CompactNode {
            id: [2u8; 20],
            addr: SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 1234),
        };
        let msg = Message::Response {
            transaction: b"cc".to_vec(),
            response: Response::GetPeers {
                id: [3u8; 20],
                token: b"xyz".to_vec(),
                nodes: vec![node],
                peers: Vec::new(),
            },
        };
        let encoded = encode_message(&msg).unwrap();
        match decode_message(&encoded).unwrap() {
            Message::Response {
                response: Response::GetPeers { nodes, .. },
                ..
            } => assert_eq!(nodes, vec![node]),
            _ => panic!("expected get_peers response"),
        }
    }

    #[test]
    fn error_message_round_trips() {
        let msg = Message::Error {
            transaction: b"dd".to_vec(),
            code: 201,
            message: "Generic Error".to_string(),
        };
        let encoded = encode_message(&msg).unwrap();
        match decode_message(&encoded).unwrap() {
            Message::Error { code, message, .. } => {
                assert_eq!(code, 201);
                assert_eq!(message, "Generic Error");
            }
            _ => panic!("expected error message"),
        }
    }

    #[test]
    fn compact_node_encode_decode_round_trips() {
        let node = CompactNode {
            id: [9u8; 20],
            addr: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 51413),
        };
        let encoded = node.encode();
        let decoded = CompactNode::decode_all(&encoded);
        assert_eq!(decoded, vec![node]);
    }
}
