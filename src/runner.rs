//! Composes `FileLayout`, `PiecePicker`, `ProgressStore`, `Session`, and
//! `PeerManager` into a single torrent download.
use crate::bitfield::Bitfield;
use crate::config::{EngineConfig, PEER_ID_PREFIX};
use crate::dht::DhtNode;
use crate::layout::FileLayout;
use crate::lsd::Lsd;
use crate::peer::manager::{Connection, DialDecision, ManagerConfig, PeerManager};
use crate::peer::{generate_peer_id, PeerId};
use crate::picker::PiecePicker;
use crate::progress::ProgressStore;
use crate::session::Session;
use crate::torrent::Metainfo;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    FetchingMeta,
    Running,
    Completed,
    Paused,
    Error,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("layout error: {0}")]
    Layout(#[from] crate::layout::LayoutError),
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

/// A resume record persisted when a download is paused: enough to
/// reconstruct progress without re-verifying from scratch.
#[derive(Debug, Clone)]
pub struct ResumeRecord {
    pub verified: Bitfield,
    pub elapsed: Duration,
}

pub struct Runner {
    info_hash: [u8; 20],
    peer_id: PeerId,
    config: EngineConfig,
    picker: Arc<PiecePicker>,
    progress: Arc<ProgressStore>,
    manager: Arc<PeerManager>,
    session: Arc<Session>,
    state: Mutex<RunState>,
    listen_port: Mutex<u16>,
    started_at: Mutex<Option<Instant>>,
}

impl Runner {
    /// Sets up a torrent download rooted at `output_dir`. `resume`, if
    /// given, seeds both the picker's done set and the progress store's
    /// verified-byte accounting from a prior run's bitfield.
    pub async fn new(
        metainfo: &Metainfo,
        output_dir: &Path,
        config: EngineConfig,
        resume: Option<Bitfield>,
        enable_dht: bool,
        enable_lsd: bool,
    ) -> RunnerResult<Arc<Self>> {
        let layout = FileLayout::create(output_dir, &metainfo.info)?;
        let total_length = metainfo.info.total_length();
        let num_pieces = metainfo.info.num_pieces();

        let picker = match &resume {
            Some(bitmap) => Arc::new(PiecePicker::with_resumed(bitmap)),
            None => Arc::new(PiecePicker::new(num_pieces)),
        };

        let progress = Arc::new(ProgressStore::new(layout, total_length));
        if let Some(bitmap) = &resume {
            progress.resume_from_bitmap(bitmap);
        }

        let peer_id = generate_peer_id(PEER_ID_PREFIX);
        let manager = Arc::new(PeerManager::new(ManagerConfig {
            max_peers: config.max_peers,
            upload_slots: config.upload_slots,
            pending_limit: config.pending_limit,
            keep_rate: config.keep_rate,
            health_cull_max_per_tick: config.health_cull_max_per_tick,
            health_factor: config.health_factor,
            health_redial_block: config.health_redial_block,
        }));

        let dht = if enable_dht {
            match DhtNode::bind("0.0.0.0:0").await {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!(%err, "dht bind failed, continuing without dht");
                    None
                }
            }
        } else {
            None
        };

        let lsd = if enable_lsd {
            match Lsd::bind().await {
                Ok(lsd) => Some(lsd),
                Err(err) => {
                    warn!(%err, "lsd bind failed, continuing without lsd");
                    None
                }
            }
        } else {
            None
        };

        let session = Arc::new(Session::new(
            metainfo.info_hash,
            peer_id,
            0,
            config.max_peers,
            progress.clone(),
            metainfo.trackers(),
            dht,
            lsd,
        ));

        let runner = Arc::new(Self {
            info_hash: metainfo.info_hash,
            peer_id,
            config,
            picker,
            progress,
            manager,
            session,
            state: Mutex::new(RunState::Init),
            listen_port: Mutex::new(0),
            started_at: Mutex::new(None),
        });

        runner.wire_completion_callback();
        Ok(runner)
    }

    fn wire_completion_callback(self: &Arc<Self>) {
        let manager = self.manager.clone();
        let progress = self.progress.clone();
        progress.set_on_verified(move |index| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.broadcast_have(index as u32).await;
            });
        });
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn listen_port(&self) -> u16 {
        *self.listen_port.lock().unwrap()
    }

    /// Binds the inbound listener first (retrying on an ephemeral port
    /// on failure), starts discovery, and spawns the maintenance loops.
    /// Returns once the download either completes or hits a fatal error;
    /// both the inbound accept loop and the maintenance loops keep
    /// running until then.
    pub async fn run(self: &Arc<Self>, preferred_port: u16) -> RunnerResult<()> {
        let listener = self.bind_listener(preferred_port).await?;
        let bound_port = listener.local_addr()?.port();
        *self.listen_port.lock().unwrap() = bound_port;
        self.session.set_listen_port(bound_port);
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.set_state(RunState::Running);
        info!(port = self.listen_port(), "torrent runner starting");

        let (peer_tx, peer_rx) = mpsc::channel(1024);
        self.session.clone().discover_peers(peer_tx);

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().dial_loop(peer_rx));
        tokio::spawn(self.clone().low_peer_mode_loop());

        self.wait_for_completion().await;
        Ok(())
    }

    async fn bind_listener(&self, preferred_port: u16) -> RunnerResult<TcpListener> {
        match TcpListener::bind(("0.0.0.0", preferred_port)).await {
            Ok(listener) => Ok(listener),
            Err(err) => {
                warn!(%err, preferred_port, "preferred listen port unavailable, falling back to ephemeral");
                Ok(TcpListener::bind(("0.0.0.0", 0)).await?)
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "inbound accept failed");
                    continue;
                }
            };
            let runner = self.clone();
            tokio::spawn(async move {
                match runner
                    .manager
                    .accept_inbound(
                        stream,
                        runner.info_hash,
                        runner.peer_id,
                        runner.picker.num_pieces(),
                        runner.picker.clone(),
                        runner.progress.clone(),
                        runner.config.peer_read_timeout,
                    )
                    .await
                {
                    Ok(conn) => runner.onboard_connection(addr, conn).await,
                    Err(err) => warn!(%addr, %err, "inbound handshake failed"),
                }
            });
        }
    }

    async fn dial_loop(self: Arc<Self>, mut peer_rx: mpsc::Receiver<SocketAddr>) {
        while let Some(addr) = peer_rx.recv().await {
            self.manager.add_discovered(addr);
            if self.manager.admit_dial(addr, Instant::now()) != DialDecision::Dial {
                continue;
            }
            self.manager.mark_pending(addr);
            let runner = self.clone();
            tokio::spawn(async move {
                let result = runner
                    .manager
                    .dial(
                        addr,
                        runner.info_hash,
                        runner.peer_id,
                        runner.picker.num_pieces(),
                        runner.picker.clone(),
                        runner.progress.clone(),
                        runner.config.dial_timeout,
                        runner.config.peer_read_timeout,
                    )
                    .await;
                match result {
                    Ok(conn) => {
                        runner.manager.record_dial_success(addr, conn.clone());
                        runner.onboard_connection(addr, conn).await;
                    }
                    Err(err) => {
                        warn!(%addr, %err, "dial failed");
                        runner.manager.record_dial_failure(addr, Instant::now());
                    }
                }
            });
        }
    }

    async fn onboard_connection(self: &Arc<Self>, addr: SocketAddr, conn: Arc<Connection>) {
        if conn.send_our_bitfield(&self.progress.bitfield()).await.is_err() {
            return;
        }
        if conn.start().await.is_err() {
            self.manager.remove_active(&addr);
            return;
        }
        let _ = conn.refill().await;
    }

    async fn low_peer_mode_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let active = self.manager.active_count();
            let low_peer = active < self.config.low_peer_threshold;
            self.session.set_low_peer_mode(low_peer);
            if self.progress.is_complete() {
                self.set_state(RunState::Completed);
                return;
            }
        }
    }

    async fn wait_for_completion(&self) {
        loop {
            if matches!(self.state(), RunState::Completed | RunState::Error | RunState::Paused) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    pub fn pause(&self) -> ResumeRecord {
        self.set_state(RunState::Paused);
        let elapsed = self
            .started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        ResumeRecord {
            verified: self.progress.bitfield(),
            elapsed,
        }
    }

    pub fn fail(&self, err: &dyn std::error::Error) {
        error!(%err, "runner entering error state");
        self.set_state(RunState::Error);
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::Info;
    use sha1::{Digest, Sha1};

    fn sample_metainfo(data: &[u8]) -> Metainfo {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Metainfo {
            info: Info {
                name: "sample.bin".into(),
                piece_length: data.len() as u64,
                pieces: vec![hasher.finalize().into()],
                private: false,
                length: Some(data.len() as u64),
                files: Vec::new(),
            },
            info_hash: [9u8; 20],
            announce: None,
            announce_list: Vec::new(),
            comment: None,
            created_by: None,
            creation_date: None,
        }
    }

    #[tokio::test]
    async fn new_runner_starts_in_init_state_with_no_listen_port() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = sample_metainfo(b"hello world");
        let runner = Runner::new(&metainfo, dir.path(), EngineConfig::default(), None, false, false)
            .await
            .unwrap();
        assert_eq!(runner.state(), RunState::Init);
        assert_eq!(runner.listen_port(), 0);
    }

    #[tokio::test]
    async fn resume_seeds_progress_as_complete() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"hello world";
        let metainfo = sample_metainfo(data);
        let mut bitmap = Bitfield::new(1);
        bitmap.set(0);
        let runner = Runner::new(&metainfo, dir.path(), EngineConfig::default(), Some(bitmap), false, false)
            .await
            .unwrap();
        assert!(runner.progress().is_complete());
    }
}
