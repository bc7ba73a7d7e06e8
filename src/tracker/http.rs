//! HTTP tracker announce (BEP-3, BEP-23 compact peers).
use super::{classify_io_kind, AnnounceRequest, AnnounceResponse, TrackerError, TrackerResult};
use crate::bencode::{self, BencodeValue};
use std::error::Error as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpTracker {
    client: reqwest::Client,
}

impl Default for HttpTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTracker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client build"),
        }
    }

    #[tracing::instrument(skip(self, announce_url, request), level = "debug")]
    pub async fn announce(&self, announce_url: &str, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let mut url = url::Url::parse(announce_url)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("info_hash", &url_encode_bytes(&request.info_hash));
            pairs.append_pair("peer_id", &url_encode_bytes(&request.peer_id));
            pairs.append_pair("port", &request.port.to_string());
            pairs.append_pair("uploaded", &request.uploaded.to_string());
            pairs.append_pair("downloaded", &request.downloaded.to_string());
            pairs.append_pair("left", &request.left.to_string());
            pairs.append_pair("compact", "1");
            pairs.append_pair("numwant", &request.numwant.to_string());
            if let Some(event) = request.event.as_http_str() {
                pairs.append_pair("event", event);
            }
        }
        // `url::Url::query_pairs_mut` percent-encodes values itself, so
        // info_hash/peer_id go through as opaque percent-escaped octets
        // rather than our own RFC3986 encoding; re-set them raw to match
        // what trackers expect for non-UTF8 byte strings.
        let query = build_raw_query(&url, request);
        url.set_query(Some(&query));

        debug!(%url, "tracker announce");
        let response = self.client.get(url).send().await.map_err(classify_reqwest_error)?;
        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        parse_announce_response(&bytes)
    }
}

/// Classifies a `reqwest` transport failure into the tracker's own
/// {Timeout, Dns, Refused, Unreachable, Unknown} buckets, for
/// observability and retry decisions, rather than a generic HTTP error.
fn classify_reqwest_error(err: reqwest::Error) -> TrackerError {
    if err.is_timeout() {
        return TrackerError::Timeout;
    }
    if err.is_connect() {
        let detail = err.to_string();
        if detail.to_ascii_lowercase().contains("dns") {
            return TrackerError::Dns(detail);
        }
        let mut source = err.source();
        while let Some(inner) = source {
            if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
                return classify_io_kind(io_err.kind(), &detail);
            }
            source = inner.source();
        }
        return TrackerError::Unreachable;
    }
    TrackerError::Unknown(err.to_string())
}

fn url_encode_bytes(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn build_raw_query(url: &url::Url, request: &AnnounceRequest) -> String {
    let mut parts: Vec<String> = url
        .query_pairs()
        .filter(|(k, _)| k != "info_hash" && k != "peer_id")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    parts.insert(0, format!("peer_id={}", url_encode_bytes(&request.peer_id)));
    parts.insert(0, format!("info_hash={}", url_encode_bytes(&request.info_hash)));
    parts.join("&")
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let value = bencode::decode(bytes)?;

    if let Some(reason) = value.dict_get("failure reason").and_then(|v| v.as_bytes()) {
        return Err(TrackerError::Failure(String::from_utf8_lossy(reason).into_owned()));
    }
    let warning = value.dict_get("warning message").and_then(|v| v.as_bytes()).map(|bytes| {
        let message = String::from_utf8_lossy(bytes).into_owned();
        warn!(%message, "tracker warning");
        message
    });

    let interval = value
        .dict_get("interval")
        .and_then(|v| v.as_integer())
        .ok_or_else(|| TrackerError::Malformed("missing interval".into()))? as u32;

    let mut peers = Vec::new();
    match value.dict_get("peers") {
        Some(BencodeValue::Bytes(compact)) => {
            for chunk in compact.chunks_exact(6) {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        }
        Some(BencodeValue::List(list)) => {
            for entry in list {
                let ip = entry
                    .dict_get("ip")
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| std::str::from_utf8(b).ok())
                    .and_then(|s| s.parse::<IpAddr>().ok());
                let port = entry.dict_get("port").and_then(|v| v.as_integer());
                if let (Some(ip), Some(port)) = (ip, port) {
                    peers.push(SocketAddr::new(ip, port as u16));
                }
            }
        }
        _ => {}
    }

    if let Some(BencodeValue::Bytes(compact6)) = value.dict_get("peers6") {
        for chunk in compact6.chunks_exact(18) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            peers.push(SocketAddr::new(IpAddr::V6(ip), port));
        }
    }

    Ok(AnnounceResponse { interval, peers, warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn parses_compact_ipv4_peers() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        dict.insert(
            b"peers".to_vec(),
            BencodeValue::Bytes(vec![127, 0, 0, 1, 0x1A, 0xE1]),
        );
        let bytes = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let response = parse_announce_response(&bytes).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port(), 6881);
    }

    #[test]
    fn parses_peers6_alongside_ipv4() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(900));
        dict.insert(b"peers".to_vec(), BencodeValue::Bytes(vec![]));
        let mut peers6 = vec![0u8; 16];
        peers6[15] = 1;
        peers6.extend_from_slice(&[0x1A, 0xE1]);
        dict.insert(b"peers6".to_vec(), BencodeValue::Bytes(peers6));
        let bytes = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let response = parse_announce_response(&bytes).unwrap();
        assert_eq!(response.peers.len(), 1);
        assert!(response.peers[0].is_ipv6());
    }

    #[test]
    fn surfaces_failure_reason_as_error() {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"failure reason".to_vec(),
            BencodeValue::Bytes(b"unregistered torrent".to_vec()),
        );
        let bytes = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let err = parse_announce_response(&bytes).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(msg) if msg == "unregistered torrent"));
    }

    #[test]
    fn parses_non_compact_peer_dicts() {
        let mut peer = BTreeMap::new();
        peer.insert(b"ip".to_vec(), BencodeValue::Bytes(b"10.0.0.5".to_vec()));
        peer.insert(b"port".to_vec(), BencodeValue::Integer(51413));
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(1200));
        dict.insert(b"peers".to_vec(), BencodeValue::List(vec![BencodeValue::Dict(peer)]));
        let bytes = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let response = parse_announce_response(&bytes).unwrap();
        assert_eq!(response.peers[0].to_string(), "10.0.0.5:51413");
    }

    #[test]
    fn captures_warning_message_as_non_fatal_field() {
        let mut dict = BTreeMap::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        dict.insert(b"peers".to_vec(), BencodeValue::Bytes(vec![]));
        dict.insert(
            b"warning message".to_vec(),
            BencodeValue::Bytes(b"partial seed list".to_vec()),
        );
        let bytes = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let response = parse_announce_response(&bytes).unwrap();
        assert_eq!(response.warning.as_deref(), Some("partial seed list"));
    }
}
