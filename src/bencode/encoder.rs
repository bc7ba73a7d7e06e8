//! Bencode encoding. Always canonical: list/dict structure is encoded
//! as-is and dictionary keys come out of a `BTreeMap`, so they are
//! always in lexicographic order on the wire.
use super::{BencodeResult, BencodeValue};
use std::io::Write;
use tracing::instrument;

fn encode_bytes<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::Bytes(s) => encode_bytes(writer, s),
        BencodeValue::List(list) => {
            writer.write_all(b"l")?;
            for item in list {
                encode_value(writer, item)?;
            }
            writer.write_all(b"e")?;
            Ok(())
        }
        BencodeValue::Dict(dict) => {
            writer.write_all(b"d")?;
            for (key, value) in dict {
                encode_bytes(writer, key)?;
                encode_value(writer, value)?;
            }
            writer.write_all(b"e")?;
            Ok(())
        }
    }
}

/// Encodes a value into its canonical bencode representation.
#[instrument(skip(value), level = "trace")]
pub fn encode(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value)?;
    Ok(buf)
}
