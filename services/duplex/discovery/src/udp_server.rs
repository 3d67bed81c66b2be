//! Supervised UDP receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duplex_session::{Retry, RetryContext, RetryTask, SessionError, DEFAULT_RETRY_DELAYS};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{error, info};

/// Default receive buffer size; longer datagrams are truncated
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 1024;

/// UDP server settings
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Address to bind
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,
    /// Size of the single reused receive buffer
    pub receive_buffer_size: usize,
    /// Backoff delays between bind attempts
    pub retry_delays: Vec<Duration>,
    /// Stop the receive loop when the server handle is dropped
    pub daemon: bool,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            daemon: false,
        }
    }
}

/// One received datagram, borrowed from the receive buffer
#[derive(Debug, Clone, Copy)]
pub struct Datagram<'a> {
    /// Sender address
    pub source: SocketAddr,
    /// Datagram contents
    pub data: &'a [u8],
}

/// Application callback for a [`UdpServer`]
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    /// Handle one datagram. `socket` is the server's bound socket, for replies.
    /// An error drops the socket and rebinds after backoff.
    async fn received(&self, socket: &UdpSocket, datagram: Datagram<'_>) -> anyhow::Result<()>;
}

struct UdpInner {
    category: String,
    name: String,
    config: UdpConfig,
    handler: Arc<dyn DatagramHandler>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl UdpInner {
    async fn receive_loop(&self, ctx: &RetryContext, socket: &UdpSocket) -> anyhow::Result<()> {
        let mut buffer = vec![0u8; self.config.receive_buffer_size.max(1)];
        while ctx.is_running() {
            let (len, source) = tokio::select! {
                received = socket.recv_from(&mut buffer) => received?,
                _ = ctx.stopped() => break,
            };
            let datagram = Datagram {
                source,
                data: &buffer[..len],
            };
            self.handler.received(socket, datagram).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Retry for UdpInner {
    async fn retry(&self, ctx: &RetryContext) -> Result<(), SessionError> {
        let socket = match UdpSocket::bind((self.config.host.as_str(), self.config.port)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!(component = %self.category, "Unable to start UDP server: {}", e);
                ctx.failed();
                return Ok(());
            }
        };
        ctx.success();

        let local = socket.local_addr().ok();
        let port = local.map_or(self.config.port, |addr| addr.port());
        info!(component = %self.category, "Listening on port: UDP {}", port);
        *self.socket.lock() = Some(socket.clone());
        self.local_addr.send_replace(local);

        let result = self.receive_loop(ctx, &socket).await;

        self.socket.lock().take();
        self.local_addr.send_replace(None);
        if let Err(e) = result {
            if ctx.is_running() {
                error!(component = %self.category, "Unexpected UDP server error: {:#}", e);
                ctx.failed();
            }
        }
        info!(component = %self.category, "Server stopped: UDP {}", port);
        Ok(())
    }
}

/// UDP server feeding every datagram to a [`DatagramHandler`]
pub struct UdpServer {
    task: RetryTask,
    inner: Arc<UdpInner>,
}

impl UdpServer {
    /// Create a stopped server
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        config: UdpConfig,
        handler: Arc<dyn DatagramHandler>,
    ) -> Self {
        let category = category.into();
        let name = name.into();
        let (local_addr, _) = watch::channel(None);
        let inner = Arc::new(UdpInner {
            category: category.clone(),
            name: name.clone(),
            config,
            handler,
            socket: Mutex::new(None),
            local_addr,
        });

        let task = RetryTask::new(category, name, inner.clone());
        task.set_retry_delays(&inner.config.retry_delays);
        task.set_daemon(inner.config.daemon);
        Self { task, inner }
    }

    /// Start receiving
    pub async fn start(&self) {
        self.task.start().await;
    }

    /// Stop receiving, release the socket and wait for the loop to exit
    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    /// Wait for the receive loop to exit
    pub async fn wait(&self) -> Result<(), Arc<SessionError>> {
        self.task.wait().await
    }

    /// Whether the receive loop is running
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Configured port
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.borrow()
    }

    /// Wait until the socket is bound (zero waits forever)
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

    /// Send `buffer` to `target` from the bound socket
    pub async fn send(&self, buffer: &[u8], target: SocketAddr) -> io::Result<usize> {
        let socket = self.inner.socket.lock().clone();
        match socket {
            Some(socket) => socket.send_to(buffer, target).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "UDP server is not bound")),
        }
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
