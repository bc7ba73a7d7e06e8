//! Peer wire protocol: handshake, framed messages, per-peer connection
//! state machine, and the manager that juggles dialing/eviction.
use rand::Rng;
use thiserror::Error;

pub mod codec;
pub mod connection;
pub mod handshake;
pub mod manager;

pub use codec::Message;
pub use connection::PeerConnection;
pub use handshake::Handshake;
pub use manager::PeerManager;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake failed: invalid protocol identifier")]
    InvalidProtocol,

    #[error("handshake failed: info hash mismatch")]
    InfoHashMismatch,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed")]
    Closed,

    #[error("canceled")]
    Canceled,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// 20-byte self-identification sent in every handshake.
pub type PeerId = [u8; 20];

/// Generates a fresh peer id with the client's Azureus-style prefix.
pub fn generate_peer_id(prefix: &[u8; 8]) -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(prefix);
    rand::rng().fill(&mut id[8..]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_carries_prefix() {
        let id = generate_peer_id(b"-RT0001-");
        assert_eq!(&id[..8], b"-RT0001-");
    }
}
