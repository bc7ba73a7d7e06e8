//! Torrent metainfo and magnet URI parsing.
//!
//! `.torrent` bytes decode into a [`Metainfo`] whose infohash is computed
//! over the exact raw bytes of the `info` dictionary, not a re-encoding of
//! it: a re-encode could disagree with whatever wire form an upstream
//! encoder actually produced.
use thiserror::Error;

pub mod info;
pub mod magnet;

pub use info::{parse_torrent, FileEntry, Info, Metainfo};
pub use magnet::{parse_magnet, Magnet};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent: {0}")]
    Invalid(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid magnet uri: {0}")]
    InvalidMagnet(String),
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
