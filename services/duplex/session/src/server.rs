//! Supervised TCP server.
//!
//! The accept loop runs inside a [`RetryTask`]: a bind or accept failure
//! drops the listener and backs off before binding again. Accepted streams
//! become [`Connection`]s tracked in a live set until they close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use duplex_wire::Message;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info};

use crate::connection::{Connection, ConnectionConfig, ConnectionHandler};
use crate::error::SessionError;
use crate::protocol::Protocol;
use crate::retry::{Retry, RetryContext, RetryTask, DEFAULT_RETRY_DELAYS};
use crate::transport::listen_tcp;

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,
    /// Settings applied to every accepted connection
    pub connection: ConnectionConfig,
    /// Backoff delays between bind attempts
    pub retry_delays: Vec<Duration>,
    /// Stop the accept loop when the server handle is dropped
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            connection: ConnectionConfig::default(),
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            daemon: false,
        }
    }
}

/// Application callbacks for a [`TcpServer`]
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// A connection was accepted and is about to start
    fn new_connection(&self, _connection: &Connection) {}

    /// A connection has started
    async fn connected(&self, _connection: &Connection) {}

    /// A connection closed; called once per connection
    fn disconnected(&self, _connection: &Connection) {}

    /// A message arrived. An error closes the connection.
    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()>;
}

/// Routes connection events back to the server
struct ServerSide {
    handler: Arc<dyn ServerHandler>,
    connections: Arc<DashMap<u64, Connection>>,
}

#[async_trait]
impl ConnectionHandler for ServerSide {
    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()> {
        self.handler.receive(connection, message).await
    }

    fn closed(&self, connection: &Connection) {
        self.connections.remove(&connection.id());
        self.handler.disconnected(connection);
    }
}

struct ServerInner {
    category: String,
    name: String,
    config: ServerConfig,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn ServerHandler>,
    side: Arc<ServerSide>,
    connections: Arc<DashMap<u64, Connection>>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl ServerInner {
    fn connections(&self) -> Vec<Connection> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn accepted(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let connection = match Connection::new(
            &self.category,
            &self.name,
            stream,
            self.protocol.clone(),
            self.side.clone(),
            self.config.connection.clone(),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                error!(component = %self.category, "Error configuring client connection from {}: {}", peer, e);
                return;
            }
        };

        self.connections.insert(connection.id(), connection.clone());
        info!(component = %self.category, "Client connected: {}", peer);
        self.handler.new_connection(&connection);
        connection.start();
        self.handler.connected(&connection).await;
    }
}

#[async_trait]
impl Retry for ServerInner {
    async fn retry(&self, ctx: &RetryContext) -> Result<(), SessionError> {
        let listener = match listen_tcp(&self.config.host, self.config.port).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(component = %self.category, "Unable to listen on {}:{}: {}", self.config.host, self.config.port, e);
                ctx.failed();
                return Ok(());
            }
        };
        let local = listener.local_addr().ok();
        info!(
            component = %self.category,
            "Listening on port: {}",
            local.map_or(self.config.port, |addr| addr.port())
        );
        self.local_addr.send_replace(local);

        while ctx.is_running() {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = ctx.stopped() => break,
            };
            match accepted {
                Ok((stream, peer)) => {
                    ctx.success();
                    self.accepted(stream, peer).await;
                }
                Err(e) => {
                    if ctx.is_running() {
                        error!(component = %self.category, "Unexpected server error: {}", e);
                        ctx.failed();
                    }
                    break;
                }
            }
        }

        self.local_addr.send_replace(None);
        Ok(())
    }

    async fn stopped(&self) {
        for connection in self.connections() {
            connection.close();
        }
        info!(component = %self.category, "Server stopped: {}", self.name);
    }
}

/// TCP server accepting connections that speak one [`Protocol`]
pub struct TcpServer {
    task: RetryTask,
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Create a stopped server
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        config: ServerConfig,
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn ServerHandler>,
    ) -> Self {
        let category = category.into();
        let name = name.into();
        let connections = Arc::new(DashMap::new());
        let (local_addr, _) = watch::channel(None);
        let inner = Arc::new(ServerInner {
            category: category.clone(),
            name: name.clone(),
            side: Arc::new(ServerSide {
                handler: handler.clone(),
                connections: connections.clone(),
            }),
            config,
            protocol,
            handler,
            connections,
            local_addr,
        });

        let task = RetryTask::new(category, name, inner.clone());
        task.set_retry_delays(&inner.config.retry_delays);
        task.set_daemon(inner.config.daemon);
        Self { task, inner }
    }

    /// Start accepting connections
    pub async fn start(&self) {
        self.task.start().await;
    }

    /// Stop accepting, close every connection and wait for the loop to exit
    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    /// Wait for the accept loop to exit
    pub async fn wait(&self) -> Result<(), Arc<SessionError>> {
        self.task.wait().await
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.borrow()
    }

    /// Wait until the server is listening (zero waits forever)
    pub async fn wait_for_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        let mut local_addr = self.inner.local_addr.subscribe();
        let listening = async {
            local_addr
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|addr| *addr)
        };
        if timeout.is_zero() {
            listening.await
        } else {
            tokio::time::timeout(timeout, listening).await.ok().flatten()
        }
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections()
    }

    /// Close every live connection; the accept loop keeps running
    pub fn close_connections(&self) {
        for connection in self.inner.connections() {
            connection.close();
        }
    }

    /// Queue a header-only message to every live connection
    pub async fn send(&self, header: &str) {
        for connection in self.inner.connections() {
            connection.send(header).await;
        }
    }

    /// Queue a message with a binary payload to every live connection
    pub async fn send_bytes(&self, header: &str, bytes: &[u8]) {
        for connection in self.inner.connections() {
            connection.send_bytes(header, bytes).await;
        }
    }

    /// Write a message to every live connection now; false if any write failed
    pub async fn send_blocking(&self, header: &str, bytes: &[u8]) -> bool {
        let mut sent = true;
        for connection in self.inner.connections() {
            sent &= connection.send_blocking(header, bytes).await;
        }
        sent
    }

    /// Log category
    pub fn category(&self) -> &str {
        &self.inner.category
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}
