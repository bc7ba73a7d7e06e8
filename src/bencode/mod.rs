//! Bencode: the binary encoding used by `.torrent` files, tracker
//! responses, and DHT KRPC messages.
//!
//! Four value kinds: signed integers, raw byte strings (not UTF-8),
//! lists, and dictionaries. Dictionary keys are byte strings and are
//! kept in a `BTreeMap`, so any value produced by [`decode`] re-encodes
//! in canonical (lexicographically sorted) key order regardless of the
//! order keys appeared on the wire.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

#[cfg(test)]
mod tests;

pub use decoder::{decode, decode_strict};
pub use encoder::encode;

/// A decoded bencode value.
///
/// `Bytes` holds raw bytes, not a UTF-8 string: torrent metadata and
/// peer wire messages routinely carry non-UTF-8 byte strings (hashes,
/// compact peer lists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn dict_get<'a>(&'a self, key: &str) -> Option<&'a BencodeValue> {
        self.as_dict()?.get(key.as_bytes())
    }
}

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bencode: {0}")]
    Malformed(String),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("dictionary keys out of lexicographic order (strict mode)")]
    UnsortedKeys,

    #[error("trailing bytes after value")]
    TrailingBytes,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
