//! Decoded messages.

use bytes::Bytes;

/// One message: a text header plus an optional binary payload.
///
/// Headers conventionally read `"<event> <payload>"`; [`Message::event`]
/// and [`Message::payload`] split them at the first space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: String,
    bytes: Bytes,
}

impl Message {
    /// Create a message with a binary payload
    pub fn new(header: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            header: header.into(),
            bytes,
        }
    }

    /// Create a header-only message
    pub fn text(header: impl Into<String>) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Full header string
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Header text before the first space, trimmed
    pub fn event(&self) -> &str {
        split_header(&self.header).0
    }

    /// Header text after the first space, trimmed
    pub fn payload(&self) -> &str {
        split_header(&self.header).1
    }

    /// Binary payload
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Number of payload bytes
    pub fn count(&self) -> usize {
        self.bytes.len()
    }

    /// Split into header and payload
    pub fn into_parts(self) -> (String, Bytes) {
        (self.header, self.bytes)
    }
}

/// Split `header` at the first space into trimmed `(event, payload)`.
///
/// A header without a space is all event and an empty payload.
pub fn split_header(header: &str) -> (&str, &str) {
    match header.split_once(' ') {
        Some((event, payload)) => (event.trim(), payload.trim()),
        None => (header.trim(), ""),
    }
}
