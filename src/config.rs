//! Engine-wide tunables. Every knob here has a spec-mandated default;
//! callers override what they need via `EngineConfig { .. Default::default() }`.
use std::time::Duration;

/// Prefixes every generated peer id (Azureus-style `-XX####-`).
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RT0001-";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_peers: usize,
    pub upload_slots: usize,
    pub pending_limit: usize,
    pub request_pipeline: usize,

    pub tracker_interval: Duration,
    pub tracker_http_timeout: Duration,
    pub tracker_udp_timeout: Duration,

    pub keep_rate: u64,
    pub health_cull_max_per_tick: usize,
    pub health_factor: f64,
    pub health_redial_block: Duration,

    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub peer_read_timeout: Duration,
    pub peer_keepalive_send: Duration,

    pub bootstrap_nodes: Vec<String>,
    pub low_peer_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_peers: 128,
            upload_slots: 0,
            pending_limit: 64,
            request_pipeline: 32,

            tracker_interval: Duration::from_secs(5),
            tracker_http_timeout: Duration::from_secs(10),
            tracker_udp_timeout: Duration::from_secs(8),

            keep_rate: 512 * 1024,
            health_cull_max_per_tick: 2,
            health_factor: 0.3,
            health_redial_block: Duration::from_secs(2 * 60),

            dial_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(8),
            peer_read_timeout: Duration::from_secs(45),
            peer_keepalive_send: Duration::from_secs(30),

            bootstrap_nodes: crate::dht::BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            low_peer_threshold: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_peers, 128);
        assert_eq!(config.upload_slots, 0);
        assert_eq!(config.request_pipeline, 32);
        assert_eq!(config.peer_read_timeout, Duration::from_secs(45));
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert!(!config.bootstrap_nodes.is_empty());
    }
}
