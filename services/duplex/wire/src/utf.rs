//! Length-prefixed modified UTF-8 strings.
//!
//! A big-endian `u16` byte count followed by the string encoded one UTF-16
//! code unit at a time: `U+0001..=U+007F` take one byte, NUL and
//! `U+0080..=U+07FF` take two, everything else (including each half of a
//! surrogate pair) takes three.

use bytes::BufMut;

use crate::WireError;

fn unit_len(unit: u16) -> usize {
    match unit {
        0x0001..=0x007F => 1,
        0x0000 | 0x0080..=0x07FF => 2,
        _ => 3,
    }
}

/// Encoded length of `value`, excluding the 2-byte prefix
pub fn utf_len(value: &str) -> usize {
    value.encode_utf16().map(unit_len).sum()
}

/// Append `value` with its length prefix
pub fn put_utf<B: BufMut>(buf: &mut B, value: &str) -> Result<(), WireError> {
    let len = utf_len(value);
    if len > usize::from(u16::MAX) {
        return Err(WireError::StringTooLong(len));
    }
    buf.put_u16(len as u16);
    for unit in value.encode_utf16() {
        match unit_len(unit) {
            1 => buf.put_u8(unit as u8),
            2 => {
                buf.put_u8(0xC0 | ((unit >> 6) & 0x1F) as u8);
                buf.put_u8(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                buf.put_u8(0xE0 | ((unit >> 12) & 0x0F) as u8);
                buf.put_u8(0x80 | ((unit >> 6) & 0x3F) as u8);
                buf.put_u8(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    Ok(())
}

/// Decode a prefixed string from the front of `src` without consuming it.
///
/// Returns the string and the total bytes it spans, or `None` when the
/// prefix or body is not fully buffered yet.
pub fn peek_utf(src: &[u8]) -> Result<Option<(String, usize)>, WireError> {
    if src.len() < 2 {
        return Ok(None);
    }
    let len = usize::from(u16::from_be_bytes([src[0], src[1]]));
    if src.len() < 2 + len {
        return Ok(None);
    }
    let body = &src[2..2 + len];
    let continuation = |at: usize| -> Result<u16, WireError> {
        match body.get(at) {
            Some(&byte) if byte & 0xC0 == 0x80 => Ok(u16::from(byte & 0x3F)),
            _ => Err(WireError::Utf(at)),
        }
    };

    let mut units = Vec::with_capacity(len);
    let mut i = 0;
    while i < len {
        let lead = u16::from(body[i]);
        match lead >> 4 {
            0..=7 => {
                units.push(lead);
                i += 1;
            }
            12 | 13 => {
                units.push(((lead & 0x1F) << 6) | continuation(i + 1)?);
                i += 2;
            }
            14 => {
                units.push(((lead & 0x0F) << 12) | (continuation(i + 1)? << 6) | continuation(i + 2)?);
                i += 3;
            }
            _ => return Err(WireError::Utf(i)),
        }
    }

    let text = String::from_utf16(&units).map_err(|_| WireError::Utf(len))?;
    Ok(Some((text, 2 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn encode(value: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, value).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_ascii() {
        assert_eq!(encode("ping"), vec![0, 4, b'p', b'i', b'n', b'g']);
        assert_eq!(encode(""), vec![0, 0]);
    }

    #[test]
    fn test_nul_takes_two_bytes() {
        assert_eq!(encode("\0"), vec![0, 2, 0xC0, 0x80]);
    }

    #[test]
    fn test_multibyte_units() {
        // U+00E9 is two bytes, U+20AC three
        assert_eq!(encode("\u{e9}"), vec![0, 2, 0xC3, 0xA9]);
        assert_eq!(encode("\u{20ac}"), vec![0, 3, 0xE2, 0x82, 0xAC]);
    }

    #[test]
    fn test_supplementary_as_surrogate_pair() {
        // U+1F600 is encoded as two 3-byte surrogates, not one 4-byte sequence
        let bytes = encode("\u{1F600}");
        assert_eq!(bytes, vec![0, 6, 0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]);
        assert_eq!(peek_utf(&bytes).unwrap(), Some(("\u{1F600}".to_string(), 8)));
    }

    #[test]
    fn test_incomplete() {
        assert!(peek_utf(&[0]).unwrap().is_none());
        assert!(peek_utf(&[0, 3, b'a', b'b']).unwrap().is_none());
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(peek_utf(&[0, 1, 0xC3]), Err(WireError::Utf(1))));
        assert!(matches!(peek_utf(&[0, 1, 0xFF]), Err(WireError::Utf(0))));
    }

    #[test]
    fn test_too_long() {
        let long = "x".repeat(70_000);
        let mut buf = BytesMut::new();
        assert!(matches!(put_utf(&mut buf, &long), Err(WireError::StringTooLong(70_000))));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(value in "\\PC{0,64}") {
            let bytes = encode(&value);
            prop_assert_eq!(bytes.len(), 2 + utf_len(&value));
            prop_assert_eq!(peek_utf(&bytes).unwrap(), Some((value, bytes.len())));
        }
    }
}
