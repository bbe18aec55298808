//! Byte-level layout of primitives and the field-chaining helper.

use crate::encoding::*;

#[test]
fn integers_are_little_endian() {
    assert_eq!(encode_to_vec(&0xDEAD_BEEFu32).unwrap(), [0xEF, 0xBE, 0xAD, 0xDE]);
    assert_eq!(
        encode_to_vec(&0x0102_0304_0506_0708u64).unwrap(),
        [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
    );
    let (v, n) = decode_from_slice::<i64>(&encode_to_vec(&i64::MIN).unwrap()).unwrap();
    assert_eq!((v, n), (i64::MIN, 8));
}

#[test]
fn short_integer_buffer_is_eof() {
    let err = decode_from_slice::<u64>(&[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::UnexpectedEof {
            needed: 8,
            available: 3
        }
    ));
}

#[test]
fn strings_must_be_utf8() {
    let (s, n) = decode_from_slice::<String>(&encode_to_vec(&"sst".to_string()).unwrap()).unwrap();
    assert_eq!((s.as_str(), n), ("sst", 7));

    let err = decode_from_slice::<String>(&[2, 0, 0, 0, 0xC3, 0x28]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidUtf8(_)));
}

#[test]
fn option_rejects_unknown_tag() {
    let err = decode_from_slice::<Option<u32>>(&[9, 0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 9, .. }));
}

#[test]
fn byte_slice_and_vec_share_layout() {
    let owned = encode_to_vec(&b"abc".to_vec()).unwrap();
    let borrowed = encode_to_vec(&&b"abc"[..]).unwrap();
    assert_eq!(owned, borrowed);
    assert_eq!(owned, [3, 0, 0, 0, b'a', b'b', b'c']);
}

#[test]
fn decode_at_chains_fields() {
    let mut buf = Vec::new();
    7u32.encode_to(&mut buf).unwrap();
    b"key".to_vec().encode_to(&mut buf).unwrap();
    Some(-5i64).encode_to(&mut buf).unwrap();

    let mut off = 0;
    assert_eq!(decode_at::<u32>(&buf, &mut off).unwrap(), 7);
    assert_eq!(decode_at::<Vec<u8>>(&buf, &mut off).unwrap(), b"key");
    assert_eq!(decode_at::<Option<i64>>(&buf, &mut off).unwrap(), Some(-5));
    assert_eq!(off, buf.len());

    assert!(decode_at::<u8>(&buf, &mut off).is_err());
}
