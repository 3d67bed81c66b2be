//! UDP servers, subnet broadcast and host discovery for duplex.
//!
//! A [`BroadcastServer`] answers every datagram that starts with the 9-byte
//! [`MAGIC`] prefix. A client broadcasts the prefix to every local subnet
//! with [`BroadcastClient::find`] and takes the first valid reply:
//!
//! ```text
//! client                                     server (UDP port P)
//!   |-- MAGIC ++ request --> x.y.z.255:P ------->|
//!   |<------------- MAGIC ++ response -----------|
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use duplex_discovery::{BroadcastClient, Subnets, UdpBroadcast};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), duplex_discovery::DiscoveryError> {
//! let mut broadcast = UdpBroadcast::new(Subnets::ClassC);
//! if let Some(found) = BroadcastClient::find("broadcast", &mut broadcast, 54777, Duration::from_secs(3), &[]).await? {
//!     println!("server at {}", found.source.ip());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod discovery;
pub mod error;
pub mod udp_server;

// Re-export main types
pub use broadcast::{broadcast_addresses, Subnets, UdpBroadcast};
pub use discovery::{
    is_valid, BroadcastClient, BroadcastServer, Discovered, DiscoveryConfig, DiscoveryListener, DiscoveryResponder,
    MagicResponder, DEFAULT_DISCOVERY_INTERVAL, DEFAULT_DISCOVERY_PORT, DEFAULT_DISCOVERY_TIMEOUT, MAGIC,
};
pub use error::DiscoveryError;
pub use udp_server::{Datagram, DatagramHandler, UdpConfig, UdpServer, DEFAULT_RECEIVE_BUFFER_SIZE};
