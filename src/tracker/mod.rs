//! HTTP and UDP tracker announce clients.
use std::net::SocketAddr;
use thiserror::Error;

pub mod http;
pub mod udp;

pub use http::HttpTracker;
pub use udp::UdpTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    None,
}

impl Event {
    pub fn as_udp_code(self) -> u32 {
        match self {
            Event::None => 0,
            Event::Completed => 1,
            Event::Started => 2,
            Event::Stopped => 3,
        }
    }

    pub fn as_http_str(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub numwant: u32,
    pub event: Event,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
    /// The tracker's non-fatal `warning message`, if it sent one.
    pub warning: Option<String>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("unexpected action {0}")]
    UnexpectedAction(u32),

    #[error("timed out")]
    Timeout,

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("connection refused")]
    Refused,

    #[error("host or network unreachable")]
    Unreachable,

    #[error("unknown transport error: {0}")]
    Unknown(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Classifies a transport-level I/O error for observability and retry
/// decisions, distinct from the generic `Io` variant used for the
/// handful of call sites (in-memory buffer writes, cursor reads) that
/// can't actually fail from a network condition.
pub(crate) fn classify_io_error(err: std::io::Error) -> TrackerError {
    let detail = err.to_string();
    classify_io_kind(err.kind(), &detail)
}

pub(crate) fn classify_io_kind(kind: std::io::ErrorKind, detail: &str) -> TrackerError {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::ConnectionRefused => TrackerError::Refused,
        ErrorKind::TimedOut => TrackerError::Timeout,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable | ErrorKind::AddrNotAvailable => {
            TrackerError::Unreachable
        }
        _ => TrackerError::Unknown(detail.to_string()),
    }
}
