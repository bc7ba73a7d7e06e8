//! Per-peer connection state machine: request pipelining with adaptive
//! flow control, incoming message handling, and piece reassembly.
use super::codec::{self, Message, BLOCK_SIZE};
use super::{PeerError, PeerId, PeerResult};
use crate::bitfield::Bitfield;
use crate::picker::PiecePicker;
use crate::progress::ProgressStore;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;

const MIN_IN_FLIGHT: u32 = 16;
const MAX_IN_FLIGHT: u32 = 2048;
const INITIAL_IN_FLIGHT: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Pending,
    InFlight,
    Received,
}

struct ActivePiece {
    size: u32,
    buffer: Vec<u8>,
    block_states: Vec<BlockState>,
}

impl ActivePiece {
    fn new(size: u32) -> Self {
        let num_blocks = size.div_ceil(BLOCK_SIZE) as usize;
        Self {
            size,
            buffer: vec![0u8; size as usize],
            block_states: vec![BlockState::Pending; num_blocks],
        }
    }

    fn block_range(&self, block_index: usize) -> (u32, u32) {
        let begin = block_index as u32 * BLOCK_SIZE;
        let end = (begin + BLOCK_SIZE).min(self.size);
        (begin, end)
    }

    fn next_pending_block(&self) -> Option<usize> {
        self.block_states
            .iter()
            .position(|s| *s == BlockState::Pending)
    }

    fn is_complete(&self) -> bool {
        self.block_states.iter().all(|s| *s == BlockState::Received)
    }
}

/// Shared, lock-protected state mutated by both the read task and the
/// request-refill logic. Write emission itself is serialized separately
/// via a writer mutex, not this lock.
pub struct ConnectionState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub peer_bitfield: Bitfield,
    active_pieces: BTreeMap<u32, ActivePiece>,
    in_flight: u32,
    max_in_flight: u32,
    pub first_seen: Instant,
    pub last_rx: Instant,
    pub rx_bytes_total: u64,
    window_start: Instant,
    window_bytes: u64,
    pub ut_pex_id: Option<u8>,
}

impl ConnectionState {
    fn new(num_pieces: usize) -> Self {
        let now = Instant::now();
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: Bitfield::new(num_pieces),
            active_pieces: BTreeMap::new(),
            in_flight: 0,
            max_in_flight: INITIAL_IN_FLIGHT,
            first_seen: now,
            last_rx: now,
            rx_bytes_total: 0,
            window_start: now,
            window_bytes: 0,
            ut_pex_id: None,
        }
    }

    /// Adjusts `max_in_flight` per the 1-second tuning window schedule.
    /// Call once per second with bytes received since the last call.
    fn tune(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return;
        }
        let bps = self.window_bytes as f64 / elapsed.as_secs_f64();
        let mib = 1024.0 * 1024.0;
        let delta: i64 = if bps > 32.0 * mib {
            128
        } else if bps > 16.0 * mib {
            64
        } else if bps > 8.0 * mib {
            32
        } else if bps > 4.0 * mib {
            16
        } else if bps > 1.0 * mib {
            8
        } else if bps < 256.0 * 1024.0 {
            -8
        } else if bps < 1.0 * mib {
            -2
        } else {
            0
        };
        let updated = (self.max_in_flight as i64 + delta)
            .clamp(MIN_IN_FLIGHT as i64, MAX_IN_FLIGHT as i64) as u32;
        self.max_in_flight = updated;
        self.window_start = Instant::now();
        self.window_bytes = 0;
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn has_room(&self) -> bool {
        !self.peer_choking && self.in_flight < self.max_in_flight
    }

    pub fn active_piece_indices(&self) -> Vec<u32> {
        self.active_pieces.keys().copied().collect()
    }
}

/// Reason a connection closed, surfaced to `on_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    Canceled,
    Eof,
    Timeout,
    Protocol,
}

pub struct PeerConnection<W> {
    pub addr: SocketAddr,
    pub peer_id: PeerId,
    pub state: Mutex<ConnectionState>,
    picker: Arc<PiecePicker>,
    progress: Arc<ProgressStore>,
    writer: AsyncMutex<W>,
    closed: AtomicBool,
    rx_bytes: AtomicU64,
}

impl<W: AsyncWrite + Unpin> PeerConnection<W> {
    pub fn new(
        addr: SocketAddr,
        peer_id: PeerId,
        num_pieces: usize,
        picker: Arc<PiecePicker>,
        progress: Arc<ProgressStore>,
        writer: W,
    ) -> Self {
        Self {
            addr,
            peer_id,
            state: Mutex::new(ConnectionState::new(num_pieces)),
            picker,
            progress,
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            rx_bytes: AtomicU64::new(0),
        }
    }

    pub async fn send(&self, msg: &Message) -> PeerResult<()> {
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, msg).await
    }

    pub async fn send_keep_alive(&self) -> PeerResult<()> {
        self.send(&Message::KeepAlive).await
    }

    pub async fn send_our_bitfield(&self, bf: &Bitfield) -> PeerResult<()> {
        if bf.count_ones() == 0 {
            return Ok(());
        }
        self.send(&Message::Bitfield(bf.as_bytes().to_vec())).await
    }

    pub async fn start(&self) -> PeerResult<()> {
        self.send(&Message::Interested).await?;
        self.state.lock().unwrap().am_interested = true;
        Ok(())
    }

    /// Issues requests up to the adaptive ceiling from the active pieces,
    /// activating a fresh piece from the picker when there's spare
    /// capacity and no active piece has a pending block.
    pub async fn refill(&self) -> PeerResult<()> {
        loop {
            let next_request = {
                let mut state = self.state.lock().unwrap();
                if !state.has_room() {
                    None
                } else {
                    let pick = state
                        .active_pieces
                        .iter_mut()
                        .find_map(|(index, piece)| {
                            piece.next_pending_block().map(|b| (*index, b))
                        });
                    match pick {
                        Some((index, block_index)) => {
                            let piece = state.active_pieces.get_mut(&index).unwrap();
                            let (begin, end) = piece.block_range(block_index);
                            piece.block_states[block_index] = BlockState::InFlight;
                            state.in_flight += 1;
                            Some((index, begin, end - begin))
                        }
                        None => {
                            let bf = state.peer_bitfield.clone();
                            drop(state);
                            let picked = if self.picker.endgame_active() {
                                self.picker.next_from_bitfield_endgame(&bf)
                            } else {
                                self.picker.next_from_bitfield(&bf)
                            };
                            match picked {
                                Some(index) => {
                                    let size = self.progress.layout().piece_size(index as usize) as u32;
                                    let mut state = self.state.lock().unwrap();
                                    state
                                        .active_pieces
                                        .entry(index as u32)
                                        .or_insert_with(|| ActivePiece::new(size));
                                    continue;
                                }
                                None => return Ok(()),
                            }
                        }
                    }
                }
            };

            match next_request {
                Some((index, begin, length)) => {
                    self.send(&Message::Request { index, begin, length }).await?;
                }
                None => return Ok(()),
            }
        }
    }

    fn observe_receive(&self, state: &mut ConnectionState, bytes: usize) {
        state.last_rx = Instant::now();
        state.rx_bytes_total += bytes as u64;
        state.window_bytes += bytes as u64;
        state.tune();
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Handles one incoming message. Returns `Ok(true)` if the request
    /// window should be refilled afterward.
    pub async fn handle_message(&self, msg: Message) -> PeerResult<bool> {
        match msg {
            Message::KeepAlive => Ok(false),
            Message::Choke => {
                self.state.lock().unwrap().peer_choking = true;
                Ok(false)
            }
            Message::Unchoke => {
                self.state.lock().unwrap().peer_choking = false;
                Ok(true)
            }
            Message::Interested => {
                self.state.lock().unwrap().peer_interested = true;
                Ok(false)
            }
            Message::NotInterested => {
                self.state.lock().unwrap().peer_interested = false;
                Ok(false)
            }
            Message::Bitfield(bits) => {
                let bf = {
                    let mut state = self.state.lock().unwrap();
                    let len = self.progress.layout().num_pieces();
                    state.peer_bitfield = Bitfield::from_bytes(bits, len);
                    state.peer_bitfield.clone()
                };
                self.picker.observe_bitfield(&bf);
                Ok(true)
            }
            Message::Have(index) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if index as usize >= state.peer_bitfield.len() {
                        state.peer_bitfield.grow(index as usize + 1);
                    }
                    state.peer_bitfield.set(index as usize);
                }
                self.picker.observe_have(index as usize);
                Ok(true)
            }
            Message::Request { index, begin, length } => {
                let am_choking = self.state.lock().unwrap().am_choking;
                if am_choking || !self.progress.layout().has_piece(index as usize) {
                    return Ok(false);
                }
                let data = self
                    .progress
                    .layout()
                    .read_at_piece(index as usize, begin as u64, length as usize)
                    .map_err(|e| PeerError::Protocol(e.to_string()))?;
                self.send(&Message::Piece { index, begin, block: data }).await?;
                Ok(false)
            }
            Message::Piece { index, begin, block } => {
                self.on_piece(index, begin, block).await
            }
            Message::Cancel { .. } => Ok(false),
            Message::Extended { id, payload } => {
                self.on_extended(id, payload);
                Ok(false)
            }
        }
    }

    async fn on_piece(&self, index: u32, begin: u32, block: Vec<u8>) -> PeerResult<bool> {
        let (completed, maybe_buffer) = {
            let mut state = self.state.lock().unwrap();
            self.observe_receive(&mut state, block.len());

            let Some(piece) = state.active_pieces.get_mut(&index) else {
                return Ok(false);
            };
            let block_index = (begin / BLOCK_SIZE) as usize;
            let (start, end) = piece.block_range(block_index);
            let len = (end - start) as usize;
            if block.len() < len {
                return Err(PeerError::Protocol("short block".into()));
            }
            piece.buffer[start as usize..end as usize].copy_from_slice(&block[..len]);
            if piece.block_states.get(block_index) != Some(&BlockState::Received) {
                piece.block_states[block_index] = BlockState::Received;
                if state.in_flight > 0 {
                    state.in_flight -= 1;
                }
            }

            let piece_ref = state.active_pieces.get(&index).unwrap();
            if piece_ref.is_complete() {
                let buffer = state.active_pieces.remove(&index).unwrap().buffer;
                (true, Some(buffer))
            } else {
                (false, None)
            }
        };

        if completed {
            let buffer = maybe_buffer.unwrap();
            match self.progress.verify_piece_data(index as usize, &buffer) {
                Ok(()) => {
                    if let Err(e) = self.progress.write_at_piece(index as usize, 0, &buffer) {
                        return Err(PeerError::Protocol(e.to_string()));
                    }
                    self.picker.done(index as usize);
                }
                Err(_) => {
                    self.picker.requeue(index as usize);
                }
            }
        }
        Ok(true)
    }

    fn on_extended(&self, id: u8, payload: Vec<u8>) {
        if id == 0 {
            if let Ok(m) = codec::parse_extended_handshake(&payload) {
                if let Some(&pex_id) = m.get("ut_pex") {
                    self.state.lock().unwrap().ut_pex_id = Some(pex_id);
                }
            }
        }
        // ut_pex (and any other non-zero extension) payloads are handled
        // by the manager, which owns the discovery feed; this layer only
        // records the negotiated extension ids.
    }

    /// Re-queues all unfinished active pieces on close, per the
    /// cancellation contract.
    pub fn requeue_active_on_close(&self) {
        let state = self.state.lock().unwrap();
        for index in state.active_pieces.keys() {
            self.picker.requeue(*index as usize);
        }
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}

/// Extracts peer addresses from a parsed ut_pex extended message,
/// filtering out non-routable/loopback/link-local candidates per the
/// PEX onboarding rule.
pub fn extract_pex_peers(payload: &[u8]) -> Vec<SocketAddr> {
    codec::parse_ut_pex(payload)
        .unwrap_or_default()
        .into_iter()
        .filter(is_routable_candidate)
        .collect()
}

fn is_routable_candidate(addr: &SocketAddr) -> bool {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => {
            !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local() && !is_cgnat(ip)
        }
        std::net::IpAddr::V6(ip) => !ip.is_loopback() && !ip.is_unspecified(),
    }
}

fn is_cgnat(ip: std::net::Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::FileLayout;
    use crate::torrent::Info;
    use sha1::{Digest, Sha1};

    fn setup(piece_len: u64, data: &[u8]) -> (Arc<PiecePicker>, Arc<ProgressStore>) {
        let dir = tempfile::tempdir().unwrap();
        let mut hasher = Sha1::new();
        hasher.update(data);
        let info = Info {
            name: "f".into(),
            piece_length: piece_len,
            pieces: vec![hasher.finalize().into()],
            private: false,
            length: Some(data.len() as u64),
            files: Vec::new(),
        };
        let layout = FileLayout::create(dir.path(), &info).unwrap();
        let progress = Arc::new(ProgressStore::new(layout, data.len() as u64));
        let picker = Arc::new(PiecePicker::new(1));
        (picker, progress)
    }

    #[tokio::test]
    async fn unchoke_then_piece_completes_and_marks_done() {
        let data = vec![7u8; BLOCK_SIZE as usize];
        let (picker, progress) = setup(BLOCK_SIZE as u64, &data);
        let conn = PeerConnection::new(
            "127.0.0.1:6881".parse().unwrap(),
            [0u8; 20],
            1,
            picker.clone(),
            progress.clone(),
            tokio::io::sink(),
        );

        let mut bf = Bitfield::new(1);
        bf.set(0);
        conn.handle_message(Message::Bitfield(bf.into_bytes())).await.unwrap();
        conn.handle_message(Message::Unchoke).await.unwrap();
        {
            let mut state = conn.state.lock().unwrap();
            state.active_pieces.insert(0, ActivePiece::new(BLOCK_SIZE));
        }

        conn.handle_message(Message::Piece { index: 0, begin: 0, block: data.clone() }).await.unwrap();
        assert!(picker.is_complete());
        assert!(progress.layout().has_piece(0));
    }

    #[test]
    fn tune_increases_ceiling_for_fast_peer() {
        let mut state = ConnectionState::new(1);
        state.window_start = Instant::now() - Duration::from_secs(2);
        state.window_bytes = 40 * 1024 * 1024; // ~20 MiB/s
        state.tune();
        assert_eq!(state.max_in_flight, INITIAL_IN_FLIGHT + 64);
    }

    #[test]
    fn tune_decreases_ceiling_for_slow_peer() {
        let mut state = ConnectionState::new(1);
        state.window_start = Instant::now() - Duration::from_secs(2);
        state.window_bytes = 100 * 1024; // ~50 KiB/s
        state.tune();
        assert_eq!(state.max_in_flight, INITIAL_IN_FLIGHT - 8);
    }

    #[test]
    fn tune_clamps_to_bounds() {
        let mut state = ConnectionState::new(1);
        state.max_in_flight = MIN_IN_FLIGHT;
        state.window_start = Instant::now() - Duration::from_secs(2);
        state.window_bytes = 10; // effectively 0 Bps
        state.tune();
        assert_eq!(state.max_in_flight, MIN_IN_FLIGHT);
    }

    #[test]
    fn routable_filter_excludes_loopback_and_cgnat() {
        use std::net::{Ipv4Addr, SocketAddrV4};
        let loopback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1));
        let cgnat = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(100, 64, 0, 1), 1));
        let routable = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 1));
        assert!(!is_routable_candidate(&loopback));
        assert!(!is_routable_candidate(&cgnat));
        assert!(is_routable_candidate(&routable));
    }
}
