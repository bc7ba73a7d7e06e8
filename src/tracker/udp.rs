//! UDP tracker announce (BEP-15).
//!
//! The wire format here is a fixed binary layout, not bencode, so
//! requests and responses are built and parsed by hand with
//! `byteorder` rather than run through the bencode codec.
use super::{classify_io_error, AnnounceRequest, AnnounceResponse, Event, TrackerError, TrackerResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

const PROTOCOL_ID: u64 = 0x0004_1727_1019_80;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const RECV_TIMEOUT: Duration = Duration::from_millis(300);
const MAX_ATTEMPTS: u32 = 2;

pub struct UdpTracker {
    socket: UdpSocket,
}

impl UdpTracker {
    pub async fn bind() -> TrackerResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(classify_io_error)?;
        Ok(Self { socket })
    }

    #[tracing::instrument(skip(self, request), fields(%addr))]
    pub async fn announce(&self, addr: SocketAddr, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let connection_id = self.connect(addr).await?;
        self.do_announce(addr, connection_id, request).await
    }

    async fn connect(&self, addr: SocketAddr) -> TrackerResult<u64> {
        let tid = rand::rng().random::<u32>();
        let mut req = Vec::with_capacity(16);
        req.write_u64::<BigEndian>(PROTOCOL_ID)?;
        req.write_u32::<BigEndian>(ACTION_CONNECT)?;
        req.write_u32::<BigEndian>(tid)?;

        let mut buf = [0u8; 16];
        let reply = self.roundtrip(addr, &req, &mut buf).await?;
        if reply.len() < 16 {
            return Err(TrackerError::Malformed("connect response too short".into()));
        }

        let mut cursor = Cursor::new(reply);
        let action = cursor.read_u32::<BigEndian>()?;
        let reply_tid = cursor.read_u32::<BigEndian>()?;
        if reply_tid != tid {
            return Err(TrackerError::TransactionMismatch);
        }
        if action != ACTION_CONNECT {
            return Err(TrackerError::UnexpectedAction(action));
        }
        Ok(cursor.read_u64::<BigEndian>()?)
    }

    async fn do_announce(
        &self,
        addr: SocketAddr,
        connection_id: u64,
        request: &AnnounceRequest,
    ) -> TrackerResult<AnnounceResponse> {
        let tid = rand::rng().random::<u32>();
        let mut req = Vec::with_capacity(98);
        req.write_u64::<BigEndian>(connection_id)?;
        req.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
        req.write_u32::<BigEndian>(tid)?;
        req.extend_from_slice(&request.info_hash);
        req.extend_from_slice(&request.peer_id);
        req.write_u64::<BigEndian>(request.downloaded)?;
        req.write_u64::<BigEndian>(request.left)?;
        req.write_u64::<BigEndian>(request.uploaded)?;
        req.write_u32::<BigEndian>(request.event.as_udp_code())?;
        req.write_u32::<BigEndian>(0)?; // ip = default
        req.write_u32::<BigEndian>(0)?; // key
        let numwant = if request.numwant == 0 { -1 } else { request.numwant as i32 };
        req.write_i32::<BigEndian>(numwant)?;
        req.write_u16::<BigEndian>(request.port)?;

        let mut buf = [0u8; 2048];
        let reply = self.roundtrip(addr, &req, &mut buf).await?;
        if reply.len() < 20 {
            return Err(TrackerError::Malformed("announce response too short".into()));
        }

        let mut cursor = Cursor::new(reply);
        let action = cursor.read_u32::<BigEndian>()?;
        let reply_tid = cursor.read_u32::<BigEndian>()?;
        if reply_tid != tid {
            return Err(TrackerError::TransactionMismatch);
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::UnexpectedAction(action));
        }
        let interval = cursor.read_u32::<BigEndian>()?;
        let _leechers = cursor.read_u32::<BigEndian>()?;
        let _seeders = cursor.read_u32::<BigEndian>()?;

        let remaining = &reply[cursor.position() as usize..];
        let mut peers = Vec::new();
        for chunk in remaining.chunks_exact(6) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            peers.push(SocketAddr::new(IpAddr::V4(ip), port));
        }

        Ok(AnnounceResponse { interval, peers, warning: None })
    }

    async fn roundtrip<'a>(&self, addr: SocketAddr, request: &[u8], buf: &'a mut [u8]) -> TrackerResult<&'a [u8]> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if let Err(err) = self.socket.send_to(request, addr).await {
                last_err = Some(classify_io_error(err));
                continue;
            }
            match timeout(RECV_TIMEOUT, self.socket.recv_from(buf)).await {
                Ok(Ok((len, from))) if from == addr => return Ok(&buf[..len]),
                Ok(Ok(_)) => continue, // packet from unexpected source, ignore and retry
                Ok(Err(err)) => last_err = Some(classify_io_error(err)),
                Err(_) => {
                    debug!(attempt, "udp tracker roundtrip timed out");
                    last_err = Some(TrackerError::Timeout);
                }
            }
        }
        Err(last_err.unwrap_or(TrackerError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as TokioUdpSocket;

    async fn fake_tracker(action_connect: u32, action_announce: u32) -> SocketAddr {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let mut cursor = Cursor::new(&buf[..len]);
            let _protocol_id = cursor.read_u64::<BigEndian>().unwrap();
            let _action = cursor.read_u32::<BigEndian>().unwrap();
            let tid = cursor.read_u32::<BigEndian>().unwrap();

            let mut resp = Vec::new();
            resp.write_u32::<BigEndian>(action_connect).unwrap();
            resp.write_u32::<BigEndian>(tid).unwrap();
            resp.write_u64::<BigEndian>(42).unwrap();
            server.send_to(&resp, from).await.unwrap();

            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let mut cursor = Cursor::new(&buf[..len]);
            let _conn_id = cursor.read_u64::<BigEndian>().unwrap();
            let _action = cursor.read_u32::<BigEndian>().unwrap();
            let tid = cursor.read_u32::<BigEndian>().unwrap();

            let mut resp = Vec::new();
            resp.write_u32::<BigEndian>(action_announce).unwrap();
            resp.write_u32::<BigEndian>(tid).unwrap();
            resp.write_u32::<BigEndian>(1800).unwrap();
            resp.write_u32::<BigEndian>(0).unwrap();
            resp.write_u32::<BigEndian>(0).unwrap();
            server.send_to(&resp, from).await.unwrap();
        });
        addr
    }

    fn sample_request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [1u8; 20],
            peer_id: [2u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            numwant: 50,
            event: Event::Started,
        }
    }

    #[tokio::test]
    async fn connect_then_announce_returns_empty_peers() {
        let addr = fake_tracker(ACTION_CONNECT, ACTION_ANNOUNCE).await;
        let client = UdpTracker::bind().await.unwrap();
        let response = client.announce(addr, &sample_request()).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert!(response.peers.is_empty());
    }

    #[tokio::test]
    async fn mismatched_connect_action_is_rejected() {
        let addr = fake_tracker(99, ACTION_ANNOUNCE).await;
        let client = UdpTracker::bind().await.unwrap();
        let err = client.announce(addr, &sample_request()).await.unwrap_err();
        assert!(matches!(err, TrackerError::UnexpectedAction(99)));
    }

    #[tokio::test]
    async fn timing_out_surfaces_timeout_error() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let client = UdpTracker::bind().await.unwrap();
        let err = client.announce(addr, &sample_request()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Timeout));
    }
}
