//! Bencode decoding.
//!
//! Operates over a byte slice with a cursor rather than a generic
//! `Read`, so callers can recover the exact byte span of any decoded
//! sub-value (the torrent parser needs this to preserve the raw `info`
//! bytes for infohash computation).
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use tracing::instrument;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn advance(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, want: u8) -> BencodeResult<()> {
        let got = self.advance()?;
        if got != want {
            return Err(BencodeError::Malformed(format!(
                "expected '{}', got '{}'",
                want as char, got as char
            )));
        }
        Ok(())
    }

    fn read_until(&mut self, delim: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let b = self.peek()?;
            if b == delim {
                let slice = &self.buf[start..self.pos];
                self.pos += 1;
                return Ok(slice);
            }
            self.pos += 1;
        }
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn decode_integer(cur: &mut Cursor<'_>) -> BencodeResult<i64> {
    cur.expect(b'i')?;
    let digits = cur.read_until(b'e')?;
    let s = std::str::from_utf8(digits)
        .map_err(|_| BencodeError::Malformed("non-UTF8 integer".into()))?;

    if s.is_empty() {
        return Err(BencodeError::Malformed("empty integer".into()));
    }
    if s == "-0" {
        return Err(BencodeError::Malformed("negative zero".into()));
    }
    let digits_only = s.strip_prefix('-').unwrap_or(s);
    if digits_only.len() > 1 && digits_only.starts_with('0') {
        return Err(BencodeError::Malformed("leading zero in integer".into()));
    }
    s.parse::<i64>()
        .map_err(|e| BencodeError::Malformed(format!("invalid integer '{s}': {e}")))
}

fn decode_bytes<'a>(cur: &mut Cursor<'a>) -> BencodeResult<&'a [u8]> {
    let len_digits = cur.read_until(b':')?;
    let len_str = std::str::from_utf8(len_digits)
        .map_err(|_| BencodeError::Malformed("non-UTF8 string length".into()))?;
    if len_str.is_empty() || (len_str.len() > 1 && len_str.starts_with('0')) {
        return Err(BencodeError::Malformed(format!(
            "invalid string length '{len_str}'"
        )));
    }
    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::Malformed(format!("invalid string length '{len_str}'")))?;
    cur.take(len)
}

fn decode_value(cur: &mut Cursor<'_>, strict: bool) -> BencodeResult<BencodeValue> {
    match cur.peek()? {
        b'i' => Ok(BencodeValue::Integer(decode_integer(cur)?)),
        b'l' => {
            cur.expect(b'l')?;
            let mut items = Vec::new();
            while cur.peek()? != b'e' {
                items.push(decode_value(cur, strict)?);
            }
            cur.expect(b'e')?;
            Ok(BencodeValue::List(items))
        }
        b'd' => {
            cur.expect(b'd')?;
            let mut dict = BTreeMap::new();
            let mut last_key: Option<Vec<u8>> = None;
            while cur.peek()? != b'e' {
                let key = decode_bytes(cur)?.to_vec();
                if strict {
                    if let Some(prev) = &last_key {
                        if key <= *prev {
                            return Err(BencodeError::UnsortedKeys);
                        }
                    }
                    last_key = Some(key.clone());
                }
                let value = decode_value(cur, strict)?;
                dict.insert(key, value);
            }
            cur.expect(b'e')?;
            Ok(BencodeValue::Dict(dict))
        }
        b'0'..=b'9' => Ok(BencodeValue::Bytes(decode_bytes(cur)?.to_vec())),
        other => Err(BencodeError::Malformed(format!(
            "unexpected byte '{}'",
            other as char
        ))),
    }
}

/// Decodes a single bencode value, accepting dictionary keys in any
/// order. Trailing bytes after the value are an error.
#[instrument(skip(bytes), level = "trace")]
pub fn decode(bytes: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cur = Cursor::new(bytes);
    let value = decode_value(&mut cur, false)?;
    if cur.pos != cur.buf.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Like [`decode`], but additionally rejects dictionaries whose keys
/// were not encountered in strictly increasing lexicographic order.
#[instrument(skip(bytes), level = "trace")]
pub fn decode_strict(bytes: &[u8]) -> BencodeResult<BencodeValue> {
    let mut cur = Cursor::new(bytes);
    let value = decode_value(&mut cur, true)?;
    if cur.pos != cur.buf.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes a single value as a prefix of `bytes`, returning the value
/// and the number of bytes consumed. Used by the torrent parser to
/// recover the exact byte span of the `info` dictionary.
pub fn decode_prefix(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    let mut cur = Cursor::new(bytes);
    let value = decode_value(&mut cur, false)?;
    Ok((value, cur.pos))
}
