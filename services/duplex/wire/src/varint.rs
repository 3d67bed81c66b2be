//! Variable length unsigned integers.
//!
//! Seven bits per byte, least significant group first; the high bit of a
//! byte is set when another byte follows. A `u32` takes 1 to 5 bytes.

use bytes::BufMut;

use crate::WireError;

/// Maximum encoded length of a `u32`
pub const MAX_VARINT_LEN: usize = 5;

/// Number of bytes `value` occupies once encoded
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Append `value` to `buf`
pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u32) {
    while value >> 7 != 0 {
        buf.put_u8((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a varint from the front of `src` without consuming it.
///
/// Returns the value and its encoded length, or `None` when `src` ends
/// before the final byte.
pub fn peek_varint(src: &[u8]) -> Result<Option<(u32, usize)>, WireError> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(WireError::VarintOverflow);
    }
    Ok(None)
}
