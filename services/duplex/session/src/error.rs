//! Session error types.

use std::time::Duration;

use duplex_wire::WireError;
use thiserror::Error;

/// Errors raised by retry loops, connections and protocols
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Operation on a closed connection
    #[error("connection closed")]
    Closed,

    /// Outbound connect did not finish in time
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target host and port
        addr: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// Protocol cannot carry a binary payload
    #[error("protocol does not carry binary payloads")]
    PayloadUnsupported,

    /// Application handler failed while processing a message
    #[error("error processing message {header:?}: {error:#}")]
    Handler {
        /// Header of the message being processed
        header: String,
        /// Error returned by the handler
        error: anyhow::Error,
    },

    /// Backoff reached a zero delay
    #[error("{0} gave up retrying")]
    RetriesExhausted(String),

    /// Unrecoverable failure inside a retry loop body
    #[error("{0}")]
    Fatal(String),
}
