//! Wire encoding for duplex connections.
//!
//! This crate holds the byte-level pieces shared by every duplex protocol:
//! variable length integers, length-prefixed modified UTF-8 strings, the
//! binary message codec and the delimiter-based line buffer used by text
//! protocols. Nothing here touches a socket; callers feed bytes in and take
//! messages out.
//!
//! ## Features
//!
//! - **Varint**: 1-5 byte little-endian base-128 lengths
//! - **Modified UTF-8**: bit-exact 16-bit length prefixed strings
//! - **Incremental Decoding**: `MessageDecoder` resumes across partial reads
//! - **Zero-Copy Payloads**: payloads are split out of the receive buffer as `Bytes`
//! - **Line Framing**: `LineBuffer` with compaction and 50% growth
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------------+
//! | u16 header_len (BE)  | length of the encoded header       |
//! +----------------------+------------------------------------+
//! | header               | modified UTF-8, "event payload"    |
//! +----------------------+------------------------------------+
//! | varint count         | 1-5 bytes, 7 bits each, MSB = more |
//! +----------------------+------------------------------------+
//! | payload              | exactly `count` bytes (may be 0)   |
//! +----------------------+------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;
pub mod text;
pub mod utf;
pub mod varint;

// Re-export main types
pub use codec::{encode_message, MessageDecoder, DEFAULT_MAX_PAYLOAD_SIZE};
pub use error::WireError;
pub use message::{split_header, Message};
pub use text::{Charset, LineBuffer, DEFAULT_LINE_BUFFER_SIZE};
pub use utf::{peek_utf, put_utf, utf_len};
pub use varint::{peek_varint, put_varint, varint_len, MAX_VARINT_LEN};
