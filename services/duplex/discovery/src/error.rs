//! Discovery error types.

use thiserror::Error;

/// Errors raised by UDP broadcast and discovery
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// `bind` called on a broadcaster that already holds a socket
    #[error("broadcaster is already bound")]
    AlreadyBound,

    /// Broadcast attempted before `bind`
    #[error("broadcaster is not bound")]
    NotBound,

    /// No broadcast addresses to send to
    #[error("no broadcast addresses available")]
    NoAddresses,

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
