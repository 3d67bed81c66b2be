//! Length-prefixed binary framing.

use async_trait::async_trait;
use bytes::BytesMut;
use duplex_wire::{encode_message, MessageDecoder, DEFAULT_MAX_PAYLOAD_SIZE};
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;

use super::Protocol;
use crate::connection::Connection;
use crate::error::SessionError;

const INITIAL_READ_BUFFER: usize = 8 * 1024;

/// Header, varint count and payload per message.
///
/// The receive buffer is reused for the life of the connection and only
/// grows.
#[derive(Debug, Clone)]
pub struct DefaultProtocol {
    max_payload_size: usize,
}

impl DefaultProtocol {
    /// Create the protocol with the default payload limit
    pub fn new() -> Self {
        Self::with_max_payload_size(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create the protocol rejecting payloads above `max_payload_size`
    pub fn with_max_payload_size(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    /// Largest accepted payload
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for DefaultProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Protocol for DefaultProtocol {
    async fn read(&self, connection: &Connection, reader: &mut OwnedReadHalf) -> Result<(), SessionError> {
        let mut decoder = MessageDecoder::with_max_payload_size(self.max_payload_size);
        let mut buffer = BytesMut::with_capacity(INITIAL_READ_BUFFER);
        loop {
            while let Some(message) = decoder.decode(&mut buffer)? {
                connection.deliver(message).await?;
            }
            if connection.read_buf(reader, &mut buffer).await? == 0 {
                if !buffer.is_empty() && !decoder.is_mid_message() {
                    debug!(component = connection.category(), "Discarding {} bytes of partial header", buffer.len());
                }
                return Ok(decoder.end_of_stream(buffer.len())?);
            }
        }
    }

    fn encode(&self, header: &str, bytes: &[u8], dst: &mut BytesMut) -> Result<(), SessionError> {
        Ok(encode_message(header, bytes, dst)?)
    }
}
