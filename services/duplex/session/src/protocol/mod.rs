//! Pluggable message framing.
//!
//! A [`Protocol`] decides how a [`Connection`](crate::Connection) turns the
//! inbound byte stream into messages and how an outbound message becomes
//! bytes. One protocol value may serve many connections; per-stream state
//! lives inside the read loop.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::tcp::OwnedReadHalf;

use crate::connection::Connection;
use crate::error::SessionError;

mod default;
mod text;

pub use default::DefaultProtocol;
pub use text::TextProtocol;

/// Message framing for a connection
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Read messages until the stream ends, passing each to [`Connection::deliver`].
    ///
    /// Returns `Ok` for a clean end of stream. Reads should go through
    /// [`Connection::read_buf`] or [`Connection::read`] so closing the
    /// connection interrupts them.
    async fn read(&self, connection: &Connection, reader: &mut OwnedReadHalf) -> Result<(), SessionError>;

    /// Append the encoding of one message to `dst`
    fn encode(&self, header: &str, bytes: &[u8], dst: &mut BytesMut) -> Result<(), SessionError>;

    /// Whether messages may carry a binary payload
    fn carries_bytes(&self) -> bool {
        true
    }
}
