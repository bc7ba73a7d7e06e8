//! `magnet:?xt=urn:btih:...` URI parsing.
use super::{TorrentError, TorrentResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magnet {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

fn decode_base32_infohash(input: &str) -> TorrentResult<[u8; 20]> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut result = [0u8; 20];
    let mut buffer: u64 = 0;
    let mut bits = 0u32;
    let mut idx = 0usize;

    for c in input.to_ascii_uppercase().bytes() {
        let value = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| TorrentError::InvalidMagnet(format!("invalid base32 character '{c}'")))?
            as u64;
        buffer = (buffer << 5) | value;
        bits += 5;
        while bits >= 8 && idx < 20 {
            bits -= 8;
            result[idx] = ((buffer >> bits) & 0xFF) as u8;
            idx += 1;
        }
    }

    if idx != 20 {
        return Err(TorrentError::InvalidMagnet(
            "base32 infohash did not decode to 20 bytes".into(),
        ));
    }
    Ok(result)
}

fn decode_hex_infohash(input: &str) -> TorrentResult<[u8; 20]> {
    let mut hash = [0u8; 20];
    hex::decode_to_slice(input, &mut hash)
        .map_err(|e| TorrentError::InvalidMagnet(format!("invalid hex infohash: {e}")))?;
    Ok(hash)
}

/// Parses `magnet:?xt=urn:btih:<hex40-or-base32-32>&dn=...&tr=...`.
pub fn parse_magnet(uri: &str) -> TorrentResult<Magnet> {
    let query = uri
        .strip_prefix("magnet:?")
        .ok_or_else(|| TorrentError::InvalidMagnet("missing magnet:? prefix".into()))?;

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "xt" => {
                let hash_part = value
                    .strip_prefix("urn:btih:")
                    .ok_or_else(|| TorrentError::InvalidMagnet(format!("unsupported xt value: {value}")))?;
                info_hash = Some(match hash_part.len() {
                    40 => decode_hex_infohash(hash_part)?,
                    32 => decode_base32_infohash(hash_part)?,
                    other => {
                        return Err(TorrentError::InvalidMagnet(format!(
                            "infohash must be 40 hex or 32 base32 chars, got {other}"
                        )));
                    }
                });
            }
            "dn" => display_name = Some(value.into_owned()),
            "tr" => trackers.push(value.into_owned()),
            _ => {}
        }
    }

    let info_hash = info_hash.ok_or_else(|| TorrentError::InvalidMagnet("missing xt parameter".into()))?;

    Ok(Magnet {
        info_hash,
        display_name,
        trackers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_infohash() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Example&tr=http%3A%2F%2Ftracker.example%2Fannounce";
        let magnet = parse_magnet(uri).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), "0123456789abcdef0123456789abcdef01234567");
        assert_eq!(magnet.display_name.as_deref(), Some("Example"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example/announce"]);
    }

    #[test]
    fn parses_base32_infohash() {
        // "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA" (32 chars) decodes to 20 zero bytes.
        let uri = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let magnet = parse_magnet(uri).unwrap();
        assert_eq!(magnet.info_hash, [0u8; 20]);
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(parse_magnet("http://example.com").is_err());
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(parse_magnet("magnet:?dn=foo").is_err());
    }

    #[test]
    fn rejects_wrong_length_infohash() {
        assert!(parse_magnet("magnet:?xt=urn:btih:deadbeef").is_err());
    }

    #[test]
    fn collects_multiple_trackers() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&tr=http%3A%2F%2Fa&tr=http%3A%2F%2Fb";
        let magnet = parse_magnet(uri).unwrap();
        assert_eq!(magnet.trackers, vec!["http://a", "http://b"]);
    }
}
