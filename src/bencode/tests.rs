use super::*;
use std::collections::BTreeMap;

#[test]
fn encodes_example_dict_canonically() {
    let mut dict = BTreeMap::new();
    dict.insert(b"spam".to_vec(), BencodeValue::List(vec![
        BencodeValue::Bytes(b"a".to_vec()),
        BencodeValue::Bytes(b"b".to_vec()),
    ]));
    dict.insert(b"cow".to_vec(), BencodeValue::Bytes(b"moo".to_vec()));
    let value = BencodeValue::Dict(dict);

    let bytes = encode(&value).unwrap();
    assert_eq!(bytes, b"d3:cow3:moo4:spaml1:a1:bee");

    let decoded = decode(&bytes).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn round_trip_is_identity_for_canonical_values() {
    let mut inner = BTreeMap::new();
    inner.insert(b"a".to_vec(), BencodeValue::Integer(-7));
    inner.insert(b"b".to_vec(), BencodeValue::List(vec![BencodeValue::Integer(0)]));
    let value = BencodeValue::Dict(inner);

    let encoded = encode(&value).unwrap();
    let decoded = decode(&encoded).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(encode(&decoded).unwrap(), encoded);
}

#[test]
fn decoder_accepts_out_of_order_keys_but_reencodes_sorted() {
    // "b" before "a" on the wire.
    let wire = b"d1:bi2e1:ai1ee";
    let value = decode(wire).unwrap();
    let reencoded = encode(&value).unwrap();
    assert_eq!(reencoded, b"d1:ai1e1:bi2ee");
}

#[test]
fn strict_decode_rejects_out_of_order_keys() {
    let wire = b"d1:bi2e1:ai1ee";
    assert!(matches!(
        decode_strict(wire),
        Err(BencodeError::UnsortedKeys)
    ));
}

#[test]
fn rejects_leading_zero_integer() {
    assert!(decode(b"i03e").is_err());
}

#[test]
fn accepts_zero_integer() {
    assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
}

#[test]
fn rejects_negative_zero() {
    assert!(decode(b"i-0e").is_err());
}

#[test]
fn rejects_truncated_string() {
    assert!(matches!(decode(b"5:ab"), Err(BencodeError::UnexpectedEof)));
}

#[test]
fn rejects_trailing_bytes() {
    assert!(matches!(
        decode(b"i1ei2e"),
        Err(BencodeError::TrailingBytes)
    ));
}

#[test]
fn decode_prefix_reports_consumed_length() {
    let wire = b"d3:fooi1eetrailing-garbage";
    let (value, consumed) = decoder::decode_prefix(wire).unwrap();
    assert_eq!(consumed, 14);
    assert_eq!(&wire[..consumed], b"d3:fooi1ee");
    assert!(value.as_dict().is_some());
}
