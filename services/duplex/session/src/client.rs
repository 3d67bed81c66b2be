//! Supervised TCP client.
//!
//! The connect loop runs inside a [`RetryTask`]. Each attempt connects,
//! runs the connection until it closes and then loops to reconnect; a
//! failed connect backs off first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duplex_wire::Message;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionConfig, ConnectionHandler};
use crate::error::SessionError;
use crate::protocol::Protocol;
use crate::retry::{Retry, RetryContext, RetryTask, DEFAULT_RETRY_DELAYS};
use crate::transport::connect_tcp;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Give up a connect attempt after this long (zero waits forever)
    pub connect_timeout: Duration,
    /// Settings applied to each connection
    pub connection: ConnectionConfig,
    /// Backoff delays between failed connect attempts
    pub retry_delays: Vec<Duration>,
    /// Stop the connect loop when the client handle is dropped
    pub daemon: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection: ConnectionConfig::default(),
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            daemon: false,
        }
    }
}

/// Application callbacks for a [`TcpClient`]
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    /// A connection was established and started
    async fn connected(&self, _connection: &Connection) {}

    /// The connection closed; the client reconnects afterwards while running
    async fn disconnected(&self, _connection: &Connection) {}

    /// A message arrived. An error closes the connection.
    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()>;
}

/// Forwards messages and wakes waiters on closure
struct ClientSide {
    handler: Arc<dyn ClientHandler>,
    state: watch::Sender<Option<Connection>>,
}

#[async_trait]
impl ConnectionHandler for ClientSide {
    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()> {
        self.handler.receive(connection, message).await
    }

    fn closed(&self, _connection: &Connection) {
        self.state.send_modify(|_| {});
    }
}

struct ClientInner {
    category: String,
    name: String,
    config: ClientConfig,
    protocol: Arc<dyn Protocol>,
    side: Arc<ClientSide>,
}

impl ClientInner {
    fn connection(&self) -> Option<Connection> {
        self.side.state.borrow().clone()
    }
}

#[async_trait]
impl Retry for ClientInner {
    async fn retry(&self, ctx: &RetryContext) -> Result<(), SessionError> {
        let host = &self.config.host;
        let port = self.config.port;
        let connected = tokio::select! {
            connected = connect_tcp(host, port, self.config.connect_timeout) => connected,
            _ = ctx.stopped() => return Ok(()),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                error!(component = %self.category, "Unable to connect: {}:{}: {}", host, port, e);
                ctx.failed();
                return Ok(());
            }
        };
        ctx.success();

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
                error!(component = %self.category, "Error configuring connection to {}:{}: {}", host, port, e);
                ctx.failed();
                return Ok(());
            }
        };

        info!(component = %self.category, "Connected: {}", connection.peer_addr());
        connection.start();
        self.side.state.send_replace(Some(connection.clone()));
        self.side.handler.connected(&connection).await;

        tokio::select! {
            _ = connection.wait_closed() => {}
            _ = ctx.stopped() => connection.close(),
        }
        self.side.handler.disconnected(&connection).await;
        Ok(())
    }

    async fn stopped(&self) {
        let connection = self.connection();
        if let Some(connection) = connection {
            connection.close();
        }
    }
}

/// TCP client that keeps one connection alive, reconnecting as needed
pub struct TcpClient {
    task: RetryTask,
    inner: Arc<ClientInner>,
}

impl TcpClient {
    /// Create a stopped client
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        config: ClientConfig,
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn ClientHandler>,
    ) -> Self {
        let category = category.into();
        let name = name.into();
        let (state, _) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            category: category.clone(),
            name: name.clone(),
            config,
            protocol,
            side: Arc::new(ClientSide { handler, state }),
        });

        let task = RetryTask::new(category, name, inner.clone());
        task.set_retry_delays(&inner.config.retry_delays);
        task.set_daemon(inner.config.daemon);
        Self { task, inner }
    }

    /// Start connecting
    pub async fn start(&self) {
        self.task.start().await;
    }

    /// Close the connection and stop reconnecting
    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    /// Wait for the connect loop to exit
    pub async fn wait(&self) -> Result<(), Arc<SessionError>> {
        self.task.wait().await
    }

    /// Whether the connect loop is running
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Consecutive failed connect attempts
    pub fn retry_count(&self) -> usize {
        self.task.retry_count()
    }

    /// Most recent connection, possibly closed
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection()
    }

    /// Wait for an open connection (zero waits forever); false on timeout
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut state = self.inner.side.state.subscribe();
        within(timeout, async move {
            state
                .wait_for(|connection| connection.as_ref().is_some_and(|c| !c.is_closed()))
                .await
                .is_ok()
        })
        .await
    }

    /// Wait until there is no open connection (zero waits forever); false on timeout
    pub async fn wait_for_close(&self, timeout: Duration) -> bool {
        let mut state = self.inner.side.state.subscribe();
        within(timeout, async move {
            state
                .wait_for(|connection| connection.as_ref().map_or(true, Connection::is_closed))
                .await
                .is_ok()
        })
        .await
    }

    /// Queue a header-only message; false when not connected
    pub async fn send(&self, header: &str) -> bool {
        match self.open_connection(header) {
            Some(connection) => connection.send(header).await,
            None => false,
        }
    }

    /// Queue a message with a binary payload; false when not connected
    pub async fn send_bytes(&self, header: &str, bytes: &[u8]) -> bool {
        match self.open_connection(header) {
            Some(connection) => connection.send_bytes(header, bytes).await,
            None => false,
        }
    }

    /// Write a message now; false when not connected or the write fails
    pub async fn send_blocking(&self, header: &str, bytes: &[u8]) -> bool {
        match self.open_connection(header) {
            Some(connection) => connection.send_blocking(header, bytes).await,
            None => false,
        }
    }

    /// Close the current connection; the loop reconnects while running
    pub fn close(&self) {
        if let Some(connection) = self.inner.connection() {
            connection.close();
        }
    }

    /// Log category
    pub fn category(&self) -> &str {
        &self.inner.category
    }

    /// Client name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn open_connection(&self, header: &str) -> Option<Connection> {
        match self.inner.connection() {
            Some(connection) if !connection.is_closed() => Some(connection),
            _ => {
                debug!(component = %self.inner.category, "Unable to send, not connected: {}", header);
                None
            }
        }
    }
}

async fn within<F: Future<Output = bool>>(timeout: Duration, wait: F) -> bool {
    if timeout.is_zero() {
        wait.await
    } else {
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}
