//! Supervised retry loops, duplex TCP connections, servers and clients.
//!
//! This crate provides the connection runtime for duplex: every long-lived
//! network loop (accept loop, connect loop) runs inside a [`RetryTask`] that
//! backs off on failure, and every TCP stream is a [`Connection`] with
//! independent read and write tasks over a pluggable [`Protocol`].
//!
//! ## Features
//!
//! - **Retry Supervision**: cyclic backoff delays, zero delay gives up
//! - **Duplex Connections**: bounded outbound queue plus direct locked writes
//! - **Idempotent Close**: the owner is notified exactly once
//! - **Protocols**: length-prefixed binary ([`DefaultProtocol`]) or text lines ([`TextProtocol`])
//! - **Auto-reconnect**: [`TcpClient`] reconnects after every disconnect
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use duplex_session::{Connection, DefaultProtocol, ServerConfig, ServerHandler, TcpServer};
//! use duplex_wire::Message;
//! use std::sync::Arc;
//!
//! struct Pong;
//!
//! #[async_trait]
//! impl ServerHandler for Pong {
//!     async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()> {
//!         if message.event() == "ping" {
//!             connection.send(format!("pong {}", message.payload())).await;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServerConfig {
//!     port: 4567,
//!     ..ServerConfig::default()
//! };
//! let server = TcpServer::new("server", "Server", config, Arc::new(DefaultProtocol::new()), Arc::new(Pong));
//! server.start().await;
//! server.wait().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod transport;

// Re-export main types
pub use client::{ClientConfig, ClientHandler, TcpClient, DEFAULT_CONNECT_TIMEOUT};
pub use connection::{Connection, ConnectionConfig, ConnectionHandler, DEFAULT_QUEUE_CAPACITY};
pub use error::SessionError;
pub use protocol::{DefaultProtocol, Protocol, TextProtocol};
pub use retry::{Retry, RetryContext, RetryTask, DEFAULT_RETRY_DELAYS};
pub use server::{ServerConfig, ServerHandler, TcpServer};
pub use transport::{connect_tcp, listen_tcp};
