//! Framed peer wire messages: `<u32 length><u8 id><payload>`. Length 0 is
//! a keep-alive with no id.
use super::{PeerError, PeerResult};
use crate::bencode::{self, BencodeValue};
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::KeepAlive => return 0u32.to_be_bytes().to_vec(),
            Message::Choke => body.push(0),
            Message::Unchoke => body.push(1),
            Message::Interested => body.push(2),
            Message::NotInterested => body.push(3),
            Message::Have(index) => {
                body.push(4);
                body.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                body.push(5);
                body.extend_from_slice(bits);
            }
            Message::Request { index, begin, length } => {
                body.push(6);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { index, begin, block } => {
                body.push(7);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                body.push(8);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Extended { id, payload } => {
                body.push(20);
                body.push(*id);
                body.extend_from_slice(payload);
            }
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    fn decode_body(id: u8, payload: &[u8]) -> PeerResult<Message> {
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if payload.len() != 4 {
                    return Err(PeerError::Protocol("have payload must be 4 bytes".into()));
                }
                Ok(Message::Have(BigEndian::read_u32(payload)))
            }
            5 => Ok(Message::Bitfield(payload.to_vec())),
            6 => {
                if payload.len() != 12 {
                    return Err(PeerError::Protocol("request payload must be 12 bytes".into()));
                }
                Ok(Message::Request {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::Protocol("piece payload too short".into()));
                }
                Ok(Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                })
            }
            8 => {
                if payload.len() != 12 {
                    return Err(PeerError::Protocol("cancel payload must be 12 bytes".into()));
                }
                Ok(Message::Cancel {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                })
            }
            20 => {
                if payload.is_empty() {
                    return Err(PeerError::Protocol("extended payload empty".into()));
                }
                Ok(Message::Extended {
                    id: payload[0],
                    payload: payload[1..].to_vec(),
                })
            }
            _ => Err(PeerError::Protocol(format!("unknown message id {id}"))),
        }
    }
}

/// Maximum frame length accepted from the wire: generous enough for a
/// 16 KiB block plus header slack, guards against a hostile/buggy peer
/// claiming gigabytes.
const MAX_FRAME_LEN: u32 = 1 << 20;

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> PeerResult<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = BigEndian::read_u32(&len_buf);
    if len == 0 {
        return Ok(Message::KeepAlive);
    }
    if len > MAX_FRAME_LEN {
        return Err(PeerError::Protocol(format!("frame length {len} exceeds limit")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let id = body[0];
    Message::decode_body(id, &body[1..])
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> PeerResult<()> {
    writer.write_all(&msg.encode()).await?;
    Ok(())
}

/// Builds the BEP-10 extended handshake payload: `m: {name -> id}` plus
/// an optional version string.
pub fn build_extended_handshake(supported: &[(&str, u8)], version: Option<&str>) -> Vec<u8> {
    let mut m = BTreeMap::new();
    for (name, id) in supported {
        m.insert(name.as_bytes().to_vec(), BencodeValue::Integer(*id as i64));
    }
    let mut dict = BTreeMap::new();
    dict.insert(b"m".to_vec(), BencodeValue::Dict(m));
    if let Some(v) = version {
        dict.insert(b"v".to_vec(), BencodeValue::Bytes(v.as_bytes().to_vec()));
    }
    bencode::encode(&BencodeValue::Dict(dict)).unwrap_or_default()
}

/// Result of parsing an extended handshake dict: the remote's
/// `m`-table, keyed by extension name.
pub fn parse_extended_handshake(payload: &[u8]) -> PeerResult<BTreeMap<String, u8>> {
    let value = bencode::decode(payload).map_err(|e| PeerError::Protocol(e.to_string()))?;
    let m = value
        .dict_get("m")
        .and_then(|v| v.as_dict())
        .ok_or_else(|| PeerError::Protocol("extended handshake missing m".into()))?;
    let mut out = BTreeMap::new();
    for (name, id) in m {
        if let Some(id) = id.as_integer() {
            if let Ok(name) = String::from_utf8(name.clone()) {
                out.insert(name, id as u8);
            }
        }
    }
    Ok(out)
}

/// Extracts peer addresses from a ut_pex payload's `added` (IPv4, 6-byte
/// tuples) and `added6` (IPv6, 18-byte tuples) keys.
pub fn parse_ut_pex(payload: &[u8]) -> PeerResult<Vec<SocketAddr>> {
    let value = bencode::decode(payload).map_err(|e| PeerError::Protocol(e.to_string()))?;
    let mut peers = Vec::new();

    if let Some(added) = value.dict_get("added").and_then(|v| v.as_bytes()) {
        for chunk in added.chunks_exact(6) {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = BigEndian::read_u16(&chunk[4..6]);
            peers.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }
    }
    if let Some(added6) = value.dict_get("added6").and_then(|v| v.as_bytes()) {
        for chunk in added6.chunks_exact(18) {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = Ipv6Addr::from(octets);
            let port = BigEndian::read_u16(&chunk[16..18]);
            peers.push(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)));
        }
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_request_message() {
        let msg = Message::Request { index: 1, begin: 2, length: 3 };
        let encoded = msg.encode();
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn keep_alive_round_trips() {
        let encoded = Message::KeepAlive.encode();
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[tokio::test]
    async fn piece_message_carries_block_bytes() {
        let msg = Message::Piece { index: 0, begin: 0, block: vec![9, 9, 9] };
        let encoded = msg.encode();
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_message(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn extended_handshake_round_trips_m_table() {
        let payload = build_extended_handshake(&[("ut_pex", 1)], Some("test/1.0"));
        let m = parse_extended_handshake(&payload).unwrap();
        assert_eq!(m.get("ut_pex"), Some(&1));
    }

    #[test]
    fn parses_ut_pex_ipv4_and_ipv6() {
        let mut dict = BTreeMap::new();
        dict.insert(b"added".to_vec(), BencodeValue::Bytes(vec![127, 0, 0, 1, 0x1A, 0xE1]));
        let mut added6 = vec![0u8; 16];
        added6[15] = 1;
        added6.extend_from_slice(&[0x1A, 0xE1]);
        dict.insert(b"added6".to_vec(), BencodeValue::Bytes(added6));
        let payload = bencode::encode(&BencodeValue::Dict(dict)).unwrap();

        let peers = parse_ut_pex(&payload).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881)));
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let mut len_buf = Vec::new();
        len_buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(len_buf);
        assert!(read_message(&mut cursor).await.is_err());
    }
}
