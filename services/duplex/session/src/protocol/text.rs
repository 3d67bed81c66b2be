//! Delimiter-separated text lines.

use async_trait::async_trait;
use bytes::BytesMut;
use duplex_wire::{Charset, LineBuffer, Message, WireError};
use tokio::net::tcp::OwnedReadHalf;
use tracing::trace;

use super::Protocol;
use crate::connection::Connection;
use crate::error::SessionError;

/// One message per line; headers only, no binary payloads.
///
/// Outbound headers are written as-is, so callers include the delimiter
/// themselves. Not wire compatible with [`DefaultProtocol`](super::DefaultProtocol).
#[derive(Debug, Clone)]
pub struct TextProtocol {
    charset: Charset,
    delimiter: String,
    preamble: Option<String>,
}

impl TextProtocol {
    /// Lines in `charset` terminated by `delimiter`
    pub fn new(charset: Charset, delimiter: impl Into<String>) -> Self {
        Self {
            charset,
            delimiter: delimiter.into(),
            preamble: None,
        }
    }

    /// UTF-8 lines terminated by `\n`
    pub fn lines() -> Self {
        Self::new(Charset::Utf8, "\n")
    }

    /// ISO-8859-1 lines terminated by `\r\n`
    pub fn crlf() -> Self {
        Self::new(Charset::Latin1, "\r\n")
    }

    /// Skip inbound data through `marker` before reading lines
    pub fn with_preamble(mut self, marker: impl Into<String>) -> Self {
        self.preamble = Some(marker.into());
        self
    }

    /// Character encoding
    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Line terminator
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }
}

#[async_trait]
impl Protocol for TextProtocol {
    async fn read(&self, connection: &Connection, reader: &mut OwnedReadHalf) -> Result<(), SessionError> {
        let mut lines = LineBuffer::new(self.charset, &self.delimiter)?;

        if let Some(preamble) = &self.preamble {
            let marker = self.charset.encode(preamble);
            while !lines.skip_until(&marker) {
                let n = connection.read(reader, lines.spare_mut()).await?;
                if n == 0 {
                    return Err(WireError::MissingMarker(preamble.clone()).into());
                }
                lines.filled(n);
            }
            trace!(component = connection.category(), "Skipped preamble through {:?}", preamble);
        }

        loop {
            while let Some(line) = lines.next_line() {
                connection.deliver(Message::text(line)).await?;
            }
            let n = connection.read(reader, lines.spare_mut()).await?;
            if n == 0 {
                return Ok(());
            }
            lines.filled(n);
        }
    }

    fn encode(&self, header: &str, bytes: &[u8], dst: &mut BytesMut) -> Result<(), SessionError> {
        if !bytes.is_empty() {
            return Err(SessionError::PayloadUnsupported);
        }
        dst.extend_from_slice(&self.charset.encode(header));
        Ok(())
    }

    fn carries_bytes(&self) -> bool {
        false
    }
}
