//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Varint continued past its maximum length
    #[error("varint too long")]
    VarintOverflow,

    /// String does not fit a 16-bit length prefix
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),

    /// Malformed modified UTF-8 at the given byte offset
    #[error("malformed utf at byte {0}")]
    Utf(usize),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Stream ended inside a message
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes still required to finish the message
        expected: usize,
        /// Bytes that were available
        actual: usize,
    },

    /// Stream ended before a marker was seen
    #[error("end of stream before marker: {0:?}")]
    MissingMarker(String),

    /// Line delimiter must not be empty
    #[error("empty delimiter")]
    EmptyDelimiter,
}
