//! Mainline DHT node (BEP-5): KRPC transport, routing table, and
//! iterative get_peers/announce_peer traversal.
pub mod krpc;

use crate::dht::krpc::{CompactNode, Message, Query, Response};
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.utorrent.com:6881",
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.bitcomet.com:6881",
    "dht.aelitis.com:6881",
];

const NUM_BUCKETS: usize = 160;
const BUCKET_SIZE: usize = 8;
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const TRAVERSAL_INTERVAL: Duration = Duration::from_secs(8);
const LOOKUP_FANOUT: usize = 8;

pub type NodeId = [u8; 20];

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("krpc error: {0}")]
    Krpc(#[from] krpc::KrpcError),
    #[error("request timed out")]
    Timeout,
    #[error("peer responded with an error: {0}")]
    RemoteError(String),
    #[error("unexpected response shape")]
    UnexpectedResponse,
}

pub type DhtResult<T> = std::result::Result<T, DhtError>;

pub fn random_node_id() -> NodeId {
    let mut id = [0u8; 20];
    rand::rng().fill(&mut id);
    id
}

fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Index of the bucket that `id` (relative to `self_id`) falls into:
/// the position (from the most significant bit) of the first differing
/// bit. Bucket 0 holds the furthest nodes, bucket 159 the nearest.
fn bucket_index(self_id: &NodeId, id: &NodeId) -> Option<usize> {
    let distance = xor_distance(self_id, id);
    for (byte_index, &byte) in distance.iter().enumerate() {
        if byte != 0 {
            let bit = byte.leading_zeros() as usize;
            return Some(byte_index * 8 + bit);
        }
    }
    None // distance is zero: this is self
}

/// Routing table with 160 buckets, FIFO eviction when a bucket is full,
/// never storing the local node.
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<VecDeque<CompactNode>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            buckets: (0..NUM_BUCKETS).map(|_| VecDeque::new()).collect(),
        }
    }

    pub fn insert(&mut self, node: CompactNode) {
        if node.id == self.self_id {
            return;
        }
        let Some(index) = bucket_index(&self.self_id, &node.id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        bucket.retain(|existing| existing.id != node.id);
        if bucket.len() >= BUCKET_SIZE {
            bucket.pop_front();
        }
        bucket.push_back(node);
    }

    /// Returns up to `k` nodes closest to `target`, nearest first.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<CompactNode> {
        let mut all: Vec<CompactNode> = self.buckets.iter().flatten().copied().collect();
        all.sort_by_key(|node| xor_distance(target, &node.id));
        all.truncate(k);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingQuery {
    responder: oneshot::Sender<DhtResult<(Response, SocketAddr)>>,
}

/// A running DHT node: owns the UDP socket, dispatches inbound KRPC
/// traffic, and answers `ping`/`find_node` queries from peers.
pub struct DhtNode {
    self_id: NodeId,
    socket: Arc<UdpSocket>,
    routing_table: Mutex<RoutingTable>,
    pending: Mutex<HashMap<Vec<u8>, PendingQuery>>,
    tokens_issued: Mutex<HashMap<SocketAddr, Vec<u8>>>,
}

impl DhtNode {
    pub async fn bind(bind_addr: &str) -> DhtResult<Arc<Self>> {
        let self_id = random_node_id();
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let node = Arc::new(Self {
            self_id,
            socket,
            routing_table: Mutex::new(RoutingTable::new(self_id)),
            pending: Mutex::new(HashMap::new()),
            tokens_issued: Mutex::new(HashMap::new()),
        });
        tokio::spawn(Self::recv_loop(node.clone()));
        Ok(node)
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn routing_table_len(&self) -> usize {
        self.routing_table.lock().unwrap().len()
    }

    async fn recv_loop(self_arc: Arc<Self>) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = match self_arc.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "dht socket recv error");
                    continue;
                }
            };
            let Ok(message) = krpc::decode_message(&buf[..len]) else {
                trace!(%from, "dropping malformed krpc datagram");
                continue;
            };
            self_arc.clone().handle_message(message, from).await;
        }
    }

    async fn handle_message(self: Arc<Self>, message: Message, from: SocketAddr) {
        match message {
            Message::Query { transaction, query } => {
                self.handle_query(transaction, query, from).await;
            }
            Message::Response { transaction, response } => {
                if let Response::FindNode { id, .. } | Response::GetPeers { id, .. } = &response {
                    self.remember_node(*id, from);
                }
                self.resolve_pending(&transaction, Ok((response, from)));
            }
            Message::Error { transaction, code, message } => {
                self.resolve_pending(&transaction, Err(DhtError::RemoteError(format!("{code}: {message}"))));
            }
        }
    }

    fn remember_node(&self, id: NodeId, from: SocketAddr) {
        if let SocketAddr::V4(addr) = from {
            self.routing_table.lock().unwrap().insert(CompactNode { id, addr });
        }
    }

    fn resolve_pending(&self, transaction: &[u8], result: DhtResult<(Response, SocketAddr)>) {
        let sender = self.pending.lock().unwrap().remove(transaction);
        if let Some(pending) = sender {
            let _ = pending.responder.send(result);
        }
    }

    async fn handle_query(&self, transaction: Vec<u8>, query: Query, from: SocketAddr) {
        let response = match query {
            Query::Ping { id } => {
                self.remember_node(id, from);
                Response::Ping { id: self.self_id }
            }
            Query::FindNode { id, target } => {
                self.remember_node(id, from);
                let nodes = self.routing_table.lock().unwrap().closest(&target, LOOKUP_FANOUT);
                Response::FindNode { id: self.self_id, nodes }
            }
            Query::GetPeers { id, info_hash } => {
                self.remember_node(id, from);
                let token = self.issue_token(from);
                let nodes = self.routing_table.lock().unwrap().closest(&info_hash, LOOKUP_FANOUT);
                Response::GetPeers {
                    id: self.self_id,
                    token,
                    nodes,
                    peers: Vec::new(),
                }
            }
            Query::AnnouncePeer { id, .. } => {
                self.remember_node(id, from);
                Response::AnnouncePeer { id: self.self_id }
            }
        };
        let reply = Message::Response { transaction, response };
        if let Ok(bytes) = krpc::encode_message(&reply) {
            let _ = self.socket.send_to(&bytes, from).await;
        }
    }

    fn issue_token(&self, from: SocketAddr) -> Vec<u8> {
        let mut tokens = self.tokens_issued.lock().unwrap();
        let token = tokens.entry(from).or_insert_with(|| {
            let mut bytes = vec![0u8; 8];
            rand::rng().fill(bytes.as_mut_slice());
            bytes
        });
        token.clone()
    }

    fn random_transaction() -> Vec<u8> {
        let mut t = vec![0u8; 4];
        rand::rng().fill(t.as_mut_slice());
        t
    }

    async fn query(&self, addr: SocketAddr, query: Query) -> DhtResult<Response> {
        let transaction = Self::random_transaction();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(transaction.clone(), PendingQuery { responder: tx });

        let message = Message::Query { transaction: transaction.clone(), query };
        let bytes = krpc::encode_message(&message)?;
        self.socket.send_to(&bytes, addr).await?;

        match timeout(QUERY_TIMEOUT, rx).await {
            Ok(Ok(Ok((response, _from)))) => Ok(response),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(DhtError::Timeout),
            Err(_) => {
                self.pending.lock().unwrap().remove(&transaction);
                Err(DhtError::Timeout)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> DhtResult<NodeId> {
        match self.query(addr, Query::Ping { id: self.self_id }).await? {
            Response::Ping { id } => Ok(id),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    pub async fn find_node(&self, addr: SocketAddr, target: NodeId) -> DhtResult<Vec<CompactNode>> {
        match self
            .query(addr, Query::FindNode { id: self.self_id, target })
            .await?
        {
            Response::FindNode { nodes, .. } => Ok(nodes),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    pub async fn get_peers(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
    ) -> DhtResult<(NodeId, Vec<u8>, Vec<CompactNode>, Vec<SocketAddrV4>)> {
        match self
            .query(addr, Query::GetPeers { id: self.self_id, info_hash })
            .await?
        {
            Response::GetPeers { id, token, nodes, peers } => Ok((id, token, nodes, peers)),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    pub async fn announce_peer(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
    ) -> DhtResult<()> {
        match self
            .query(
                addr,
                Query::AnnouncePeer {
                    id: self.self_id,
                    info_hash,
                    port,
                    token,
                    implied_port: false,
                },
            )
            .await?
        {
            Response::AnnouncePeer { .. } => Ok(()),
            _ => Err(DhtError::UnexpectedResponse),
        }
    }

    /// One round of iterative get_peers lookup toward `info_hash`,
    /// seeded from `bootstrap`. Returns discovered peers plus every node
    /// that answered with a token, nearest to `info_hash` first, for the
    /// caller to announce to once the round converges.
    async fn lookup_round(
        &self,
        info_hash: [u8; 20],
        seeds: Vec<SocketAddr>,
    ) -> (Vec<SocketAddrV4>, Vec<(SocketAddr, Vec<u8>)>) {
        let mut queried = HashSet::new();
        let mut frontier = seeds;
        let mut discovered = Vec::new();
        let mut responded: Vec<(NodeId, SocketAddr, Vec<u8>)> = Vec::new();

        for _ in 0..4 {
            if frontier.is_empty() {
                break;
            }
            let mut next_frontier = Vec::new();
            for addr in frontier.drain(..) {
                if !queried.insert(addr) {
                    continue;
                }
                match self.get_peers(addr, info_hash).await {
                    Ok((id, token, nodes, peers)) => {
                        discovered.extend(peers);
                        responded.push((id, addr, token));
                        for node in nodes {
                            next_frontier.push(SocketAddr::V4(node.addr));
                        }
                    }
                    Err(err) => trace!(%addr, %err, "get_peers failed during lookup"),
                }
            }
            next_frontier.truncate(LOOKUP_FANOUT);
            frontier = next_frontier;
        }

        responded.sort_by_key(|(id, _, _)| xor_distance(&info_hash, id));
        responded.truncate(LOOKUP_FANOUT);
        let closest = responded.into_iter().map(|(_, addr, token)| (addr, token)).collect();
        (discovered, closest)
    }

    /// Runs the 8-second iterative get_peers/announce loop for one
    /// infohash, emitting deduplicated peer addresses onto `out`. Once a
    /// round converges, announces `listen_port` to the closest nodes
    /// that handed back a token, so this node becomes discoverable by
    /// later lookups.
    pub async fn discover_peers(self: Arc<Self>, info_hash: [u8; 20], listen_port: u16, out: mpsc::Sender<SocketAddr>) {
        let mut seen = HashSet::new();
        loop {
            let seeds = self.seed_addresses().await;
            let (found, announce_targets) = self.lookup_round(info_hash, seeds).await;
            for addr_v4 in found {
                let addr = SocketAddr::V4(addr_v4);
                if seen.insert(addr) {
                    debug!(%addr, "dht discovered peer");
                    if out.send(addr).await.is_err() {
                        return;
                    }
                }
            }
            for (addr, token) in announce_targets {
                if let Err(err) = self.announce_peer(addr, info_hash, listen_port, token).await {
                    trace!(%addr, %err, "announce_peer failed");
                }
            }
            tokio::time::sleep(TRAVERSAL_INTERVAL).await;
        }
    }

    async fn seed_addresses(&self) -> Vec<SocketAddr> {
        let from_table: Vec<SocketAddr> = self
            .routing_table
            .lock()
            .unwrap()
            .closest(&self.self_id, LOOKUP_FANOUT)
            .into_iter()
            .map(|n| SocketAddr::V4(n.addr))
            .collect();
        if !from_table.is_empty() {
            return from_table;
        }
        resolve_bootstrap_nodes().await
    }
}

async fn resolve_bootstrap_nodes() -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in BOOTSTRAP_NODES {
        if let Ok(mut addrs) = tokio::net::lookup_host(host).await {
            if let Some(addr) = addrs.next() {
                out.push(addr);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id_with_last_byte(b: u8) -> NodeId {
        let mut id = [0u8; 20];
        id[19] = b;
        id
    }

    #[test]
    fn bucket_index_is_none_for_self() {
        let id = id_with_last_byte(1);
        assert_eq!(bucket_index(&id, &id), None);
    }

    #[test]
    fn bucket_index_is_higher_for_closer_nodes() {
        let self_id = [0u8; 20];
        let far = {
            let mut id = [0u8; 20];
            id[0] = 0x80;
            id
        };
        let near = id_with_last_byte(1);
        let far_index = bucket_index(&self_id, &far).unwrap();
        let near_index = bucket_index(&self_id, &near).unwrap();
        assert!(near_index > far_index);
    }

    #[test]
    fn routing_table_evicts_oldest_when_bucket_full() {
        let self_id = [0u8; 20];
        let mut table = RoutingTable::new(self_id);
        for i in 0..(BUCKET_SIZE as u8 + 2) {
            let mut id = [0u8; 20];
            id[19] = i + 1;
            table.insert(CompactNode {
                id,
                addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881 + i as u16),
            });
        }
        assert!(table.len() <= BUCKET_SIZE);
    }

    #[test]
    fn routing_table_never_stores_self() {
        let self_id = id_with_last_byte(5);
        let mut table = RoutingTable::new(self_id);
        table.insert(CompactNode {
            id: self_id,
            addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
        });
        assert!(table.is_empty());
    }

    #[test]
    fn closest_orders_by_xor_distance() {
        let self_id = [0u8; 20];
        let mut table = RoutingTable::new(self_id);
        let near = id_with_last_byte(1);
        let far = id_with_last_byte(0xFF);
        table.insert(CompactNode {
            id: far,
            addr: SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 1),
        });
        table.insert(CompactNode {
            id: near,
            addr: SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2),
        });
        let closest = table.closest(&self_id, 2);
        assert_eq!(closest[0].id, near);
    }

    #[tokio::test]
    async fn ping_round_trips_between_two_nodes() {
        let a = DhtNode::bind("127.0.0.1:0").await.unwrap();
        let b = DhtNode::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        let replied_id = a.ping(b_addr).await.unwrap();
        assert_eq!(replied_id, b.self_id());
    }

    #[tokio::test]
    async fn lookup_round_yields_a_token_to_announce_to() {
        let a = DhtNode::bind("127.0.0.1:0").await.unwrap();
        let b = DhtNode::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        let info_hash = [7u8; 20];

        let (_discovered, announce_targets) = a.lookup_round(info_hash, vec![b_addr]).await;

        assert_eq!(announce_targets.len(), 1);
        let (addr, token) = &announce_targets[0];
        assert_eq!(*addr, b_addr);
        assert!(!token.is_empty());

        a.announce_peer(b_addr, info_hash, 6881, token.clone()).await.unwrap();
    }
}
