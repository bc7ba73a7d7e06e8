//! Dial scheduling, inbound accept, eviction, and broadcast.
//!
//! One mutex covers the `active`/`pending`/`discovered`/`retry`/
//! `uploading` tables; there are no per-peer locks. Dial concurrency is
//! bounded by a semaphore sized `clamp(max_peers, 8, 64)`.
use super::codec::{self, Message};
use super::connection::PeerConnection;
use super::handshake::Handshake;
use super::{PeerId, PeerResult};
use crate::picker::PiecePicker;
use crate::progress::ProgressStore;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

const BASE_BACKOFF: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub max_peers: usize,
    pub upload_slots: usize,
    pub pending_limit: usize,
    pub keep_rate: u64,
    pub health_cull_max_per_tick: usize,
    pub health_factor: f64,
    pub health_redial_block: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_peers: 128,
            upload_slots: 0,
            pending_limit: 64,
            keep_rate: 512 * 1024,
            health_cull_max_per_tick: 2,
            health_factor: 0.3,
            health_redial_block: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    next_attempt: Instant,
    backoff: Duration,
}

pub type Connection = PeerConnection<OwnedWriteHalf>;

struct Tables {
    discovered: HashSet<SocketAddr>,
    pending: HashSet<SocketAddr>,
    active: HashMap<SocketAddr, Arc<Connection>>,
    retry: HashMap<SocketAddr, RetryState>,
    good_peers: HashSet<SocketAddr>,
    uploading: HashSet<SocketAddr>,
}

pub struct PeerManager {
    config: ManagerConfig,
    tables: Mutex<Tables>,
    dial_sem: Semaphore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialDecision {
    Dial,
    Drop,
}

impl PeerManager {
    pub fn new(config: ManagerConfig) -> Self {
        let permits = (config.max_peers.max(1)).clamp(8, 64);
        Self {
            config,
            tables: Mutex::new(Tables {
                discovered: HashSet::new(),
                pending: HashSet::new(),
                active: HashMap::new(),
                retry: HashMap::new(),
                good_peers: HashSet::new(),
                uploading: HashSet::new(),
            }),
            dial_sem: Semaphore::new(permits),
        }
    }

    pub fn active_count(&self) -> usize {
        self.tables.lock().unwrap().active.len()
    }

    pub fn add_discovered(&self, addr: SocketAddr) {
        self.tables.lock().unwrap().discovered.insert(addr);
    }

    pub fn add_discovered_many(&self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut tables = self.tables.lock().unwrap();
        tables.discovered.extend(addrs);
    }

    /// Evaluates dial admission steps 1-3 of the contract. Step 1's
    /// eviction attempt is delegated to `pick_eviction_candidate`, which
    /// the caller must act on (evict, then retry admission) before
    /// re-checking.
    pub fn admit_dial(&self, addr: SocketAddr, now: Instant) -> DialDecision {
        let tables = self.tables.lock().unwrap();
        if tables.active.contains_key(&addr) || tables.pending.contains(&addr) {
            return DialDecision::Drop;
        }
        if tables.active.len() >= self.config.max_peers {
            return DialDecision::Drop;
        }
        if tables.pending.len() >= self.config.pending_limit {
            return DialDecision::Drop;
        }
        if let Some(retry) = tables.retry.get(&addr) {
            if now < retry.next_attempt {
                return DialDecision::Drop;
            }
        }
        DialDecision::Dial
    }

    pub fn mark_pending(&self, addr: SocketAddr) {
        self.tables.lock().unwrap().pending.insert(addr);
    }

    pub fn record_dial_success(&self, addr: SocketAddr, conn: Arc<Connection>) {
        let mut tables = self.tables.lock().unwrap();
        tables.pending.remove(&addr);
        tables.retry.remove(&addr);
        tables.good_peers.insert(addr);
        let assign_slot = tables.uploading.len() < self.config.upload_slots;
        if assign_slot {
            tables.uploading.insert(addr);
        }
        tables.active.insert(addr, conn);
    }

    pub fn record_dial_failure(&self, addr: SocketAddr, now: Instant) {
        let mut tables = self.tables.lock().unwrap();
        tables.pending.remove(&addr);
        let backoff = tables
            .retry
            .get(&addr)
            .map(|r| (r.backoff * 2).min(MAX_BACKOFF))
            .unwrap_or(BASE_BACKOFF);
        tables.retry.insert(
            addr,
            RetryState {
                next_attempt: now + backoff,
                backoff,
            },
        );
    }

    pub fn remove_active(&self, addr: &SocketAddr) {
        let mut tables = self.tables.lock().unwrap();
        tables.active.remove(addr);
        tables.uploading.remove(addr);
    }

    pub fn should_unchoke_on_connect(&self) -> bool {
        self.tables.lock().unwrap().uploading.len() < self.config.upload_slots
    }

    /// Capacity-saturated eviction: picks the worst mature (uptime >= 20s)
    /// peer by lowest recent rate, provided its rate is below
    /// `keep_rate`. Peers idle > 45s are picked immediately regardless of
    /// rate.
    pub fn pick_eviction_candidate(&self, rates: &HashMap<SocketAddr, u64>, now: Instant) -> Option<SocketAddr> {
        let tables = self.tables.lock().unwrap();
        if tables.active.len() < self.config.max_peers {
            return None;
        }

        let mature: Vec<(&SocketAddr, &Arc<Connection>)> = tables
            .active
            .iter()
            .filter(|(_, c)| now.duration_since(c.state.lock().unwrap().first_seen) >= Duration::from_secs(20))
            .collect();

        for (addr, conn) in &mature {
            let idle = now.duration_since(conn.state.lock().unwrap().last_rx);
            if idle > Duration::from_secs(45) {
                return Some(**addr);
            }
        }

        mature
            .iter()
            .filter(|(addr, _)| rates.get(*addr).copied().unwrap_or(0) < self.config.keep_rate)
            .min_by_key(|(addr, _)| rates.get(*addr).copied().unwrap_or(0))
            .map(|(addr, _)| **addr)
    }

    /// Health culling: when at least 4 mature peers exist and their
    /// aggregate rate is at least 2x `keep_rate`, cull up to
    /// `health_cull_max_per_tick` peers whose rate is below
    /// `health_factor * mean(mature rate)`.
    pub fn health_cull_candidates(&self, rates: &HashMap<SocketAddr, u64>, now: Instant) -> Vec<SocketAddr> {
        let tables = self.tables.lock().unwrap();
        let mature: Vec<SocketAddr> = tables
            .active
            .iter()
            .filter(|(_, c)| now.duration_since(c.state.lock().unwrap().first_seen) >= Duration::from_secs(20))
            .map(|(addr, _)| *addr)
            .collect();

        if mature.len() < 4 {
            return Vec::new();
        }

        let total: u64 = mature.iter().map(|a| rates.get(a).copied().unwrap_or(0)).sum();
        if total < 2 * self.config.keep_rate {
            return Vec::new();
        }
        let mean = total as f64 / mature.len() as f64;
        let threshold = self.config.health_factor * mean;

        let mut candidates: Vec<SocketAddr> = mature
            .into_iter()
            .filter(|a| (rates.get(a).copied().unwrap_or(0) as f64) < threshold)
            .collect();
        candidates.sort_by_key(|a| rates.get(a).copied().unwrap_or(0));
        candidates.truncate(self.config.health_cull_max_per_tick);
        candidates
    }

    pub fn block_for_health_redial(&self, addr: SocketAddr, now: Instant) {
        let mut tables = self.tables.lock().unwrap();
        tables.retry.insert(
            addr,
            RetryState {
                next_attempt: now + self.config.health_redial_block,
                backoff: BASE_BACKOFF,
            },
        );
    }

    pub fn evict(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        let mut tables = self.tables.lock().unwrap();
        tables.uploading.remove(addr);
        tables.active.remove(addr)
    }

    /// Dials `addr`, performing the handshake and wiring up a fresh
    /// connection on success. Bounded by the dial semaphore.
    pub async fn dial(
        &self,
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: PeerId,
        num_pieces: usize,
        picker: Arc<PiecePicker>,
        progress: Arc<ProgressStore>,
        timeout: Duration,
        read_timeout: Duration,
    ) -> PeerResult<Arc<Connection>> {
        let _permit = self.dial_sem.acquire().await;
        let (stream, _handshake) = Handshake::dial(addr, info_hash, our_peer_id, timeout).await?;
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(PeerConnection::new(
            addr,
            our_peer_id,
            num_pieces,
            picker,
            progress,
            write_half,
        ));
        tokio::spawn(run_read_loop(conn.clone(), read_half, read_timeout));
        Ok(conn)
    }

    /// Mirrors the inbound handshake on an accepted socket and wires up a
    /// connection on the same admission path as an outbound dial.
    pub async fn accept_inbound(
        &self,
        mut stream: TcpStream,
        info_hash: [u8; 20],
        our_peer_id: PeerId,
        num_pieces: usize,
        picker: Arc<PiecePicker>,
        progress: Arc<ProgressStore>,
        read_timeout: Duration,
    ) -> PeerResult<Arc<Connection>> {
        let addr = stream.peer_addr()?;
        Handshake::accept(&mut stream, info_hash, our_peer_id).await?;
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(PeerConnection::new(
            addr,
            our_peer_id,
            num_pieces,
            picker,
            progress,
            write_half,
        ));
        tokio::spawn(run_read_loop(conn.clone(), read_half, read_timeout));
        Ok(conn)
    }

    /// Copies the active set and fans a HAVE message out to each.
    pub async fn broadcast_have(&self, index: u32) {
        let conns: Vec<Arc<Connection>> = {
            let tables = self.tables.lock().unwrap();
            tables.active.values().cloned().collect()
        };
        for conn in conns {
            let _ = conn.send(&Message::Have(index)).await;
        }
    }

    /// Filters and records PEX-discovered candidates.
    pub fn onboard_pex(&self, candidates: Vec<SocketAddr>) {
        let mut tables = self.tables.lock().unwrap();
        for addr in candidates {
            if !tables.active.contains_key(&addr) {
                tables.discovered.insert(addr);
            }
        }
    }
}

/// Drives one connection's read half: decodes framed messages, applies
/// them, and refills the request window. Re-queues the connection's
/// in-flight pieces and marks it closed when the peer goes away or the
/// read deadline (refreshed on every message) elapses.
async fn run_read_loop(conn: Arc<Connection>, mut read_half: OwnedReadHalf, read_timeout: Duration) {
    loop {
        let message = match tokio::time::timeout(read_timeout, codec::read_message(&mut read_half)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(err)) => {
                trace!(addr = %conn.addr, %err, "peer connection closed");
                break;
            }
            Err(_) => {
                debug!(addr = %conn.addr, "peer read timed out");
                break;
            }
        };

        let refill = match conn.handle_message(message).await {
            Ok(refill) => refill,
            Err(err) => {
                trace!(addr = %conn.addr, %err, "peer protocol error");
                break;
            }
        };
        if refill {
            if let Err(err) = conn.refill().await {
                trace!(addr = %conn.addr, %err, "refill after message failed");
                break;
            }
        }
    }
    conn.requeue_active_on_close();
    conn.mark_closed();
}

/// Dial concurrency, numwant, and similar policy knobs scale with
/// `max_peers`. `at least 2x max_peers, clamped [80, 300], plus a boost
/// of 200 in low-peer mode`.
pub fn numwant(max_peers: usize, low_peer_mode: bool) -> usize {
    let base = (2 * max_peers).clamp(80, 300);
    if low_peer_mode {
        base + 200
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numwant_clamps_and_boosts_in_low_peer_mode() {
        assert_eq!(numwant(10, false), 80);
        assert_eq!(numwant(1000, false), 300);
        assert_eq!(numwant(50, false), 100);
        assert_eq!(numwant(50, true), 300);
    }

    #[test]
    fn admit_dial_drops_when_already_active() {
        let manager = PeerManager::new(ManagerConfig::default());
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        manager.tables.lock().unwrap().pending.insert(addr);
        assert_eq!(manager.admit_dial(addr, Instant::now()), DialDecision::Drop);
    }

    #[test]
    fn admit_dial_drops_before_retry_elapses() {
        let manager = PeerManager::new(ManagerConfig::default());
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let now = Instant::now();
        manager.record_dial_failure(addr, now);
        assert_eq!(manager.admit_dial(addr, now), DialDecision::Drop);
    }

    #[test]
    fn record_dial_failure_doubles_backoff_up_to_cap() {
        let manager = PeerManager::new(ManagerConfig::default());
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        let now = Instant::now();
        manager.record_dial_failure(addr, now);
        let first = manager.tables.lock().unwrap().retry[&addr].backoff;
        assert_eq!(first, BASE_BACKOFF);
        manager.record_dial_failure(addr, now);
        let second = manager.tables.lock().unwrap().retry[&addr].backoff;
        assert_eq!(second, BASE_BACKOFF * 2);
    }

    #[test]
    fn health_cull_requires_at_least_four_mature_peers() {
        let manager = PeerManager::new(ManagerConfig::default());
        let rates = HashMap::new();
        let candidates = manager.health_cull_candidates(&rates, Instant::now());
        assert!(candidates.is_empty());
    }
}
