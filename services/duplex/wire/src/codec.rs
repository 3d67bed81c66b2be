//! Binary message codec.
//!
//! Encoding writes header, count and payload in one go. Decoding is
//! incremental: [`MessageDecoder`] remembers how far into a message it got
//! so a caller can keep appending socket reads to the same buffer.

use bytes::{Buf, BufMut, BytesMut};

use crate::message::Message;
use crate::utf::{peek_utf, put_utf, utf_len};
use crate::varint::{peek_varint, put_varint, varint_len};
use crate::WireError;

/// Default upper bound on a declared payload length (16 MiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Append one encoded message to `dst`
pub fn encode_message(header: &str, bytes: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
    let count = u32::try_from(bytes.len()).map_err(|_| WireError::Size(bytes.len()))?;
    dst.reserve(2 + utf_len(header) + varint_len(count) + bytes.len());
    put_utf(dst, header)?;
    put_varint(dst, count);
    dst.put_slice(bytes);
    Ok(())
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    Header,
    Count(String),
    Payload(String, usize),
}

/// Incremental message decoder
#[derive(Debug)]
pub struct MessageDecoder {
    state: DecodeState,
    max_payload_size: usize,
}

impl MessageDecoder {
    /// Create a new message decoder
    pub fn new() -> Self {
        Self::with_max_payload_size(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a decoder rejecting payloads larger than `max_payload_size`
    pub fn with_max_payload_size(max_payload_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload_size,
        }
    }

    /// Decode one message from a buffer.
    ///
    /// Consumes the bytes of each completed stage, so a message split over
    /// several reads is picked up where it left off.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::Header => match peek_utf(&buf[..])? {
                    Some((header, used)) => {
                        buf.advance(used);
                        self.state = DecodeState::Count(header);
                    }
                    None => return Ok(None),
                },
                DecodeState::Count(header) => match peek_varint(&buf[..])? {
                    Some((count, used)) => {
                        let count = count as usize;
                        if count > self.max_payload_size {
                            return Err(WireError::Size(count));
                        }
                        buf.advance(used);
                        self.state = DecodeState::Payload(header, count);
                    }
                    None => {
                        self.state = DecodeState::Count(header);
                        return Ok(None);
                    }
                },
                DecodeState::Payload(header, count) => {
                    if buf.len() < count {
                        buf.reserve(count - buf.len());
                        self.state = DecodeState::Payload(header, count);
                        return Ok(None);
                    }
                    let bytes = buf.split_to(count).freeze();
                    return Ok(Some(Message::new(header, bytes)));
                }
            }
        }
    }

    /// True once a header has been read but its message is not complete
    pub fn is_mid_message(&self) -> bool {
        !matches!(self.state, DecodeState::Header)
    }

    /// Check what the end of the stream means with `buffered` bytes left.
    ///
    /// Ending before or inside a header is a clean end; ending after the
    /// header is a truncated message.
    pub fn end_of_stream(&self, buffered: usize) -> Result<(), WireError> {
        match &self.state {
            DecodeState::Header => Ok(()),
            DecodeState::Count(_) => Err(WireError::Truncated {
                expected: buffered + 1,
                actual: buffered,
            }),
            DecodeState::Payload(_, count) => Err(WireError::Truncated {
                expected: *count,
                actual: buffered,
            }),
        }
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}
