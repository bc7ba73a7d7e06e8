//! Local Service Discovery (BEP-14): IPv4 multicast `BT-SEARCH`
//! announces and a listener that extracts peers for our infohash.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
pub const MULTICAST_PORT: u16 = 6771;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LsdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LsdResult<T> = std::result::Result<T, LsdError>;

pub struct Lsd {
    socket: UdpSocket,
}

impl Lsd {
    pub async fn bind() -> LsdResult<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).await?;
        socket.join_multicast_v4(MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;
        Ok(Arc::new(Self { socket }))
    }

    fn announce_message(info_hash: &[u8; 20], listen_port: u16) -> Vec<u8> {
        format!(
            "BT-SEARCH * HTTP/1.1\r\nHost: {MULTICAST_ADDR}:{MULTICAST_PORT}\r\nPort: {listen_port}\r\nInfohash: {}\r\n\r\n",
            hex::encode_upper(info_hash)
        )
        .into_bytes()
    }

    async fn send_announce(&self, info_hash: [u8; 20], listen_port: u16) -> LsdResult<()> {
        let message = Self::announce_message(&info_hash, listen_port);
        let dest = SocketAddrV4::new(MULTICAST_ADDR, MULTICAST_PORT);
        self.socket.send_to(&message, dest).await?;
        Ok(())
    }

    /// Sends a `BT-SEARCH` announce every 30 s until cancelled.
    pub async fn announce_loop(self: Arc<Self>, info_hash: [u8; 20], listen_port: u16) {
        loop {
            if let Err(err) = self.send_announce(info_hash, listen_port).await {
                warn!(%err, "lsd announce failed");
            }
            tokio::time::sleep(ANNOUNCE_INTERVAL).await;
        }
    }

    /// Listens for incoming announces, emitting `(sender_ip, announced_port)`
    /// pairs whose infohash matches ours.
    pub async fn listen_loop(self: Arc<Self>, info_hash: [u8; 20], out: mpsc::Sender<SocketAddr>) {
        let expected_hex = hex::encode_upper(info_hash);
        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "lsd recv error");
                    continue;
                }
            };
            if from.ip().is_unspecified() {
                trace!(%from, "ignoring lsd announce from unspecified sender");
                continue;
            }
            let Some(announce) = parse_announce(&buf[..len]) else {
                trace!(%from, "ignoring malformed lsd announce");
                continue;
            };
            if !announce.infohash.eq_ignore_ascii_case(&expected_hex) {
                continue;
            }
            let addr = SocketAddr::new(from.ip(), announce.port);
            debug!(%addr, "lsd discovered peer");
            if out.send(addr).await.is_err() {
                return;
            }
        }
    }
}

struct Announce {
    port: u16,
    infohash: String,
}

/// Parses a `BT-SEARCH` message. Headers are matched case-insensitively;
/// a missing/invalid `Port` header or missing `Infohash` header causes
/// `None`.
fn parse_announce(data: &[u8]) -> Option<Announce> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next()?;
    if !request_line.starts_with("BT-SEARCH") {
        return None;
    }

    let mut port = None;
    let mut infohash = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("port") {
            port = value.parse::<u16>().ok();
        } else if key.eq_ignore_ascii_case("infohash") {
            infohash = Some(value.to_string());
        }
    }

    Some(Announce {
        port: port?,
        infohash: infohash?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_announce_case_insensitively() {
        let msg = b"BT-SEARCH * HTTP/1.1\r\nhost: 239.192.152.143:6771\r\nPORT: 6881\r\ninfoHASH: ABCDEF0123456789ABCDEF0123456789ABCDEF01\r\n\r\n";
        let parsed = parse_announce(msg).unwrap();
        assert_eq!(parsed.port, 6881);
        assert_eq!(parsed.infohash, "ABCDEF0123456789ABCDEF0123456789ABCDEF01");
    }

    #[test]
    fn rejects_message_without_bt_search_line() {
        assert!(parse_announce(b"GET / HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn rejects_missing_port() {
        let msg = b"BT-SEARCH * HTTP/1.1\r\nInfohash: ABCDEF0123456789ABCDEF0123456789ABCDEF01\r\n\r\n";
        assert!(parse_announce(msg).is_none());
    }

    #[test]
    fn rejects_invalid_port() {
        let msg = b"BT-SEARCH * HTTP/1.1\r\nPort: notaport\r\nInfohash: ABCDEF0123456789ABCDEF0123456789ABCDEF01\r\n\r\n";
        assert!(parse_announce(msg).is_none());
    }

    #[test]
    fn announce_message_contains_hex_infohash_and_port() {
        let bytes = Lsd::announce_message(&[0xAB; 20], 6881);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Port: 6881"));
        assert!(text.contains("ABABABABABABABABABABABABABABABABABABABAB") || text.to_uppercase().contains("ABAB"));
    }
}
