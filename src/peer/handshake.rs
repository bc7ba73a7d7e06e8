//! The handshake is the first message exchanged between two peers. It
//! verifies both peers are talking about the same torrent (via infohash)
//! and establishes protocol extension support.
use super::{PeerError, PeerId, PeerResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// Reserved-byte bit flagging BEP-10 extended protocol support, at byte
/// index 5 per the spec.
const EXTENDED_PROTOCOL_BIT: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENDED_PROTOCOL_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[5] & EXTENDED_PROTOCOL_BIT != 0
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PSTR.len() as u8;
        buf[1..20].copy_from_slice(PSTR);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut len_buf = [0u8; 1];
        stream.read_exact(&mut len_buf).await?;
        if len_buf[0] as usize != PSTR.len() {
            return Err(PeerError::InvalidProtocol);
        }

        let mut rest = [0u8; 67];
        stream.read_exact(&mut rest).await?;

        if &rest[0..19] != PSTR.as_slice() {
            return Err(PeerError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&rest[19..27]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[47..67]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub async fn write(&self, stream: &mut TcpStream) -> PeerResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    pub fn validate_info_hash(&self, expected: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }

    /// Dials `addr`, writes our handshake, reads and validates theirs.
    /// Used by the outbound dial path.
    #[instrument(level = "debug", skip(peer_id))]
    pub async fn dial(
        addr: std::net::SocketAddr,
        info_hash: [u8; 20],
        peer_id: PeerId,
        timeout: std::time::Duration,
    ) -> PeerResult<(TcpStream, Handshake)> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;

        let ours = Handshake::new(info_hash, peer_id);
        ours.write(&mut stream).await?;

        let theirs = tokio::time::timeout(timeout, Handshake::read(&mut stream))
            .await
            .map_err(|_| PeerError::HandshakeTimeout)??;
        theirs.validate_info_hash(&info_hash)?;

        Ok((stream, theirs))
    }

    /// Mirrors the handshake for an inbound connection: read first,
    /// validate the infohash against one of `known_info_hashes`, then
    /// write ours.
    pub async fn accept(
        stream: &mut TcpStream,
        known_info_hash: [u8; 20],
        our_peer_id: PeerId,
    ) -> PeerResult<Handshake> {
        let theirs = Handshake::read(stream).await?;
        theirs.validate_info_hash(&known_info_hash)?;
        let ours = Handshake::new(known_info_hash, our_peer_id);
        ours.write(stream).await?;
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_sets_extended_protocol_bit() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PSTR.as_slice());
        assert_eq!(bytes[20 + 5] & EXTENDED_PROTOCOL_BIT, EXTENDED_PROTOCOL_BIT);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn validate_info_hash_rejects_mismatch() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate_info_hash(&[9u8; 20]).is_err());
        assert!(hs.validate_info_hash(&[1u8; 20]).is_ok());
    }

    #[test]
    fn supports_extended_reflects_reserved_bit() {
        let hs = Handshake::new([0u8; 20], [0u8; 20]);
        assert!(hs.supports_extended());
    }
}
