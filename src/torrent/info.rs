//! `.torrent` metainfo parsing: `parse_torrent(bytes) -> Metainfo`.
use super::{TorrentError, TorrentResult};
use crate::bencode::{self, BencodeValue};
use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub private: bool,
    /// `None` for a single-file torrent (length lives on the torrent itself).
    pub length: Option<u64>,
    pub files: Vec<FileEntry>,
}

impl Info {
    pub fn is_multi_file(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        if self.is_multi_file() {
            self.files.iter().map(|f| f.length).sum()
        } else {
            self.length.unwrap_or(0)
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index + 1 < self.num_pieces() {
            self.piece_length
        } else {
            let full = (self.num_pieces() as u64 - 1) * self.piece_length;
            self.total_length().saturating_sub(full)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: [u8; 20],
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

impl Metainfo {
    /// All tracker tiers, falling back to the single `announce` URL when
    /// no `announce-list` was present.
    pub fn trackers(&self) -> Vec<String> {
        if !self.announce_list.is_empty() {
            self.announce_list.iter().flatten().cloned().collect()
        } else {
            self.announce.iter().cloned().collect()
        }
    }
}

fn reject_unsafe_component(component: &str, what: &str) -> TorrentResult<()> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(TorrentError::Invalid(format!(
            "{what} contains an unsafe path component: {component:?}"
        )));
    }
    if component.contains('/') || component.contains('\\') {
        return Err(TorrentError::Invalid(format!(
            "{what} component contains a path separator: {component:?}"
        )));
    }
    if Path::new(component)
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
    {
        return Err(TorrentError::Invalid(format!(
            "{what} component is an absolute path: {component:?}"
        )));
    }
    Ok(())
}

fn parse_pieces(bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if bytes.is_empty() || bytes.len() % 20 != 0 {
        return Err(TorrentError::Invalid(
            "pieces length must be a positive multiple of 20".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(20)
        .map(|c| {
            let mut h = [0u8; 20];
            h.copy_from_slice(c);
            h
        })
        .collect())
}

fn parse_info(value: &BencodeValue) -> TorrentResult<Info> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TorrentError::Invalid("info is not a dictionary".into()))?;

    let name_bytes = value
        .dict_get("name")
        .and_then(|v| v.as_bytes())
        .ok_or(TorrentError::MissingField("name"))?;
    let name = String::from_utf8(name_bytes.to_vec())
        .map_err(|_| TorrentError::Invalid("name is not valid UTF-8".into()))?;
    reject_unsafe_component(&name, "name")?;

    let piece_length = value
        .dict_get("piece length")
        .and_then(|v| v.as_integer())
        .ok_or(TorrentError::MissingField("piece length"))?;
    if piece_length <= 0 {
        return Err(TorrentError::Invalid("piece length must be > 0".into()));
    }

    let pieces_bytes = value
        .dict_get("pieces")
        .and_then(|v| v.as_bytes())
        .ok_or(TorrentError::MissingField("pieces"))?;
    let pieces = parse_pieces(pieces_bytes)?;

    let private = matches!(value.dict_get("private").and_then(|v| v.as_integer()), Some(1));

    let length = value.dict_get("length").and_then(|v| v.as_integer());
    let files_value = dict.get(b"files".as_slice());

    if length.is_some() && files_value.is_some() {
        return Err(TorrentError::Invalid(
            "info has both length and files".into(),
        ));
    }

    let files = match files_value {
        Some(BencodeValue::List(items)) => {
            if items.is_empty() {
                return Err(TorrentError::Invalid("files list is empty".into()));
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let file_length = item
                    .dict_get("length")
                    .and_then(|v| v.as_integer())
                    .ok_or(TorrentError::MissingField("file length"))?;
                if file_length < 0 {
                    return Err(TorrentError::Invalid("file length must be >= 0".into()));
                }
                let path_list = item
                    .dict_get("path")
                    .and_then(|v| v.as_list())
                    .ok_or(TorrentError::MissingField("file path"))?;
                if path_list.is_empty() {
                    return Err(TorrentError::Invalid("file path is empty".into()));
                }
                let mut path = Vec::with_capacity(path_list.len());
                for component in path_list {
                    let bytes = component
                        .as_bytes()
                        .ok_or_else(|| TorrentError::Invalid("path component not a string".into()))?;
                    let component = String::from_utf8(bytes.to_vec())
                        .map_err(|_| TorrentError::Invalid("path component not UTF-8".into()))?;
                    reject_unsafe_component(&component, "file path")?;
                    path.push(component);
                }
                out.push(FileEntry {
                    length: file_length as u64,
                    path,
                });
            }
            out
        }
        Some(_) => return Err(TorrentError::Invalid("files is not a list".into())),
        None => Vec::new(),
    };

    if files.is_empty() {
        match length {
            Some(l) if l > 0 => {}
            _ => {
                return Err(TorrentError::Invalid(
                    "single-file torrent must have length > 0".into(),
                ));
            }
        }
    }

    Ok(Info {
        name,
        piece_length: piece_length as u64,
        pieces,
        private,
        length: length.map(|l| l as u64),
        files,
    })
}

/// Locates the raw byte span of the `info` dictionary's value within the
/// original torrent bytes, so the infohash can be computed over exactly
/// what was on the wire rather than a re-encoding of it.
fn locate_info_span(data: &[u8]) -> TorrentResult<(usize, usize)> {
    const KEY: &[u8] = b"4:info";
    let pos = data
        .windows(KEY.len())
        .position(|w| w == KEY)
        .ok_or(TorrentError::MissingField("info"))?;
    let start = pos + KEY.len();
    let (_, consumed) = bencode::decoder::decode_prefix(&data[start..])?;
    Ok((start, consumed))
}

pub fn parse_torrent(data: &[u8]) -> TorrentResult<Metainfo> {
    let root = bencode::decode(data)?;
    let root_dict = root
        .as_dict()
        .ok_or_else(|| TorrentError::Invalid("torrent root is not a dictionary".into()))?;

    let info_value = root
        .dict_get("info")
        .ok_or(TorrentError::MissingField("info"))?;
    let info = parse_info(info_value)?;

    let (start, len) = locate_info_span(data)?;
    let info_bytes = &data[start..start + len];
    let mut hasher = Sha1::new();
    hasher.update(info_bytes);
    let digest = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&digest);

    let announce = root
        .dict_get("announce")
        .and_then(|v| v.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned());

    let announce_list = match root_dict.get(b"announce-list".as_slice()) {
        Some(BencodeValue::List(tiers)) => tiers
            .iter()
            .filter_map(|tier| tier.as_list())
            .map(|tier| {
                tier.iter()
                    .filter_map(|t| t.as_bytes())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .collect()
            })
            .collect(),
        _ => Vec::new(),
    };

    let comment = root
        .dict_get("comment")
        .and_then(|v| v.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let created_by = root
        .dict_get("created by")
        .and_then(|v| v.as_bytes())
        .map(|b| String::from_utf8_lossy(b).into_owned());
    let creation_date = root.dict_get("creation date").and_then(|v| v.as_integer());

    Ok(Metainfo {
        info,
        info_hash,
        announce,
        announce_list,
        comment,
        created_by,
        creation_date,
    })
}

/// Resolves the on-disk path for a file entry, re-rooted under `base`.
/// Callers must have already validated path components via parsing, but
/// this re-roots defensively so no combination of entries can place a
/// write outside `base`.
pub fn resolve_file_path(base: &Path, torrent_name: &str, file: Option<&FileEntry>) -> PathBuf {
    let mut path = base.join(torrent_name);
    if let Some(file) = file {
        for component in &file.path {
            path = path.join(component);
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;
    use std::collections::BTreeMap;

    fn sample_single_file_bytes() -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"movie.mkv".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![7u8; 20]));
        info.insert(b"length".to_vec(), BencodeValue::Integer(16384));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::Bytes(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encode(&BencodeValue::Dict(root)).unwrap()
    }

    #[test]
    fn parses_single_file_torrent_and_computes_infohash() {
        let bytes = sample_single_file_bytes();
        let meta = parse_torrent(&bytes).unwrap();
        assert_eq!(meta.info.name, "movie.mkv");
        assert_eq!(meta.info.total_length(), 16384);
        assert_eq!(meta.info.num_pieces(), 1);
        assert_eq!(meta.announce.as_deref(), Some("http://tracker.example/announce"));

        // infohash must be SHA-1 of exactly the encoded info dict.
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"movie.mkv".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![7u8; 20]));
        info.insert(b"length".to_vec(), BencodeValue::Integer(16384));
        let expected_bytes = encode(&BencodeValue::Dict(info)).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(&expected_bytes);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn rejects_pieces_length_not_multiple_of_20() {
        assert!(matches!(parse_pieces(&[0u8; 19]), Err(TorrentError::Invalid(_))));
    }

    #[test]
    fn rejects_dotdot_path_component() {
        assert!(reject_unsafe_component("..", "file path").is_err());
        assert!(reject_unsafe_component(".", "file path").is_err());
        assert!(reject_unsafe_component("", "file path").is_err());
        assert!(reject_unsafe_component("ok.txt", "file path").is_ok());
    }

    #[test]
    fn rejects_absolute_path_component() {
        assert!(reject_unsafe_component("/etc/passwd", "file path").is_err());
    }

    #[test]
    fn rejects_zero_piece_length() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::Bytes(b"x".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(0));
        info.insert(b"pieces".to_vec(), BencodeValue::Bytes(vec![1u8; 20]));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));
        let value = BencodeValue::Dict(info);
        assert!(parse_info(&value).is_err());
    }
}
