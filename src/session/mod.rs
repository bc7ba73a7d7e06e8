//! Merges tracker, DHT, and LSD peer discovery into one deduplicated
//! stream, and runs the tracker announce loop.
use crate::dht::DhtNode;
use crate::lsd::Lsd;
use crate::peer::manager::numwant;
use crate::progress::ProgressStore;
use crate::tracker::{AnnounceRequest, Event, HttpTracker, TrackerError, UdpTracker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Small built-in fallback set, merged with the torrent's own explicit
/// announce list so a torrent with no (or dead) trackers still has a
/// chance at a tracker-sourced peer.
pub const FALLBACK_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "http://tracker.opentrackr.org:1337/announce",
];

const MIN_INTERVAL: Duration = Duration::from_secs(3);
const MAX_INTERVAL: Duration = Duration::from_secs(10 * 60);
const LOW_PEER_INTERVAL_CAP: Duration = Duration::from_secs(10);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const DEDUP_WINDOW: Duration = Duration::from_secs(8);
const PEER_CHANNEL_CAPACITY: usize = 1024;

struct TrackerEntry {
    url: String,
    next_attempt: Instant,
    backoff: Duration,
    sent_started: bool,
}

pub struct Session {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listen_port: AtomicU16,
    max_peers: usize,
    progress: Arc<ProgressStore>,
    uploaded: AtomicU64,
    trackers: Mutex<Vec<TrackerEntry>>,
    dht: Option<Arc<DhtNode>>,
    lsd: Option<Arc<Lsd>>,
    low_peer_mode: AtomicBool,
    http: HttpTracker,
}

impl Session {
    pub fn new(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        listen_port: u16,
        max_peers: usize,
        progress: Arc<ProgressStore>,
        explicit_trackers: Vec<String>,
        dht: Option<Arc<DhtNode>>,
        lsd: Option<Arc<Lsd>>,
    ) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut trackers = Vec::new();
        for url in explicit_trackers.into_iter().chain(FALLBACK_TRACKERS.iter().map(|s| s.to_string())) {
            if seen.insert(url.clone()) {
                trackers.push(TrackerEntry {
                    url,
                    next_attempt: Instant::now(),
                    backoff: BACKOFF_START,
                    sent_started: false,
                });
            }
        }
        Self {
            info_hash,
            peer_id,
            listen_port: AtomicU16::new(listen_port),
            max_peers,
            progress,
            uploaded: AtomicU64::new(0),
            trackers: Mutex::new(trackers),
            dht,
            lsd,
            low_peer_mode: AtomicBool::new(false),
            http: HttpTracker::new(),
        }
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Relaxed);
    }

    pub fn set_low_peer_mode(&self, active: bool) {
        self.low_peer_mode.store(active, Ordering::Relaxed);
    }

    pub fn is_low_peer_mode(&self) -> bool {
        self.low_peer_mode.load(Ordering::Relaxed)
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    fn numwant(&self) -> u32 {
        numwant(self.max_peers, self.is_low_peer_mode()) as u32
    }

    fn left(&self) -> u64 {
        self.progress.total_length().saturating_sub(self.progress.verified_bytes())
    }

    /// Spawns the tracker loop, DHT lookup, and LSD listener, merging
    /// their output into `out` with an 8-second per-address dedup
    /// window. Returns immediately; tasks run until `out` is dropped or
    /// closed.
    pub fn discover_peers(self: Arc<Self>, out: mpsc::Sender<SocketAddr>) {
        let (raw_tx, raw_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);

        tokio::spawn(self.clone().tracker_loop(raw_tx.clone()));
        if let Some(dht) = self.dht.clone() {
            let info_hash = self.info_hash;
            let listen_port = self.listen_port.load(Ordering::Relaxed);
            let tx = raw_tx.clone();
            tokio::spawn(dht.discover_peers(info_hash, listen_port, tx));
        }
        if let Some(lsd) = self.lsd.clone() {
            let info_hash = self.info_hash;
            tokio::spawn(lsd.listen_loop(info_hash, raw_tx));
        }

        tokio::spawn(dedup_forward(raw_rx, out));
    }

    async fn tracker_loop(self: Arc<Self>, out: mpsc::Sender<SocketAddr>) {
        loop {
            let due: Vec<usize> = {
                let trackers = self.trackers.lock().unwrap();
                let now = Instant::now();
                trackers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.next_attempt <= now)
                    .map(|(i, _)| i)
                    .collect()
            };

            for index in due {
                self.announce_one(index, &out).await;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn announce_one(&self, index: usize, out: &mpsc::Sender<SocketAddr>) {
        let (url, event) = {
            let mut trackers = self.trackers.lock().unwrap();
            let entry = &mut trackers[index];
            let event = if !entry.sent_started { Event::Started } else { Event::None };
            (entry.url.clone(), event)
        };

        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.listen_port.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.progress.downloaded_bytes(),
            left: self.left(),
            numwant: self.numwant(),
            event,
        };

        let result = self.announce_url(&url, &request).await;
        let mut trackers = self.trackers.lock().unwrap();
        let entry = &mut trackers[index];
        match result {
            Ok(response) => {
                entry.sent_started = true;
                entry.backoff = BACKOFF_START;
                let mut interval = Duration::from_secs(response.interval as u64).clamp(MIN_INTERVAL, MAX_INTERVAL);
                if self.is_low_peer_mode() {
                    interval = interval.min(LOW_PEER_INTERVAL_CAP);
                }
                entry.next_attempt = Instant::now() + interval;
                drop(trackers);
                for peer in response.peers {
                    if out.send(peer).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(url = %entry.url, %err, "tracker announce failed");
                entry.next_attempt = Instant::now() + entry.backoff;
                entry.backoff = (entry.backoff * 2).min(BACKOFF_CAP);
            }
        }
    }

    async fn announce_url(&self, url: &str, request: &AnnounceRequest) -> Result<crate::tracker::AnnounceResponse, TrackerError> {
        if let Some(stripped) = url.strip_prefix("udp://") {
            let host = stripped.split('/').next().unwrap_or(stripped);
            let addr = tokio::net::lookup_host(host)
                .await
                .map_err(|err| TrackerError::Dns(err.to_string()))?
                .next()
                .ok_or_else(|| TrackerError::Dns(format!("no addresses for {host}")))?;
            let client = UdpTracker::bind().await?;
            client.announce(addr, request).await
        } else {
            self.http.announce(url, request).await
        }
    }
}

async fn dedup_forward(mut raw_rx: mpsc::Receiver<SocketAddr>, out: mpsc::Sender<SocketAddr>) {
    let mut seen: HashMap<SocketAddr, Instant> = HashMap::new();
    while let Some(addr) = raw_rx.recv().await {
        let now = Instant::now();
        let is_fresh = match seen.get(&addr) {
            Some(last) => now.duration_since(*last) >= DEDUP_WINDOW,
            None => true,
        };
        if !is_fresh {
            continue;
        }
        seen.insert(addr, now);
        debug!(%addr, "session emitting discovered peer");
        if out.send(addr).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_forward_suppresses_repeats_within_window() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        tokio::spawn(dedup_forward(raw_rx, out_tx));

        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        raw_tx.send(addr).await.unwrap();
        raw_tx.send(addr).await.unwrap();
        drop(raw_tx);

        let first = out_rx.recv().await.unwrap();
        assert_eq!(first, addr);
        assert!(out_rx.recv().await.is_none());
    }

    #[test]
    fn fallback_trackers_are_deduplicated_against_explicit_list() {
        let explicit = vec![FALLBACK_TRACKERS[0].to_string()];
        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for url in explicit.into_iter().chain(FALLBACK_TRACKERS.iter().map(|s| s.to_string())) {
            if seen.insert(url.clone()) {
                merged.push(url);
            }
        }
        assert_eq!(merged.len(), FALLBACK_TRACKERS.len());
    }
}
