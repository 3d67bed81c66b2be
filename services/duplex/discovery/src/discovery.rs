//! Magic-prefixed host discovery over UDP broadcast.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use duplex_session::{Retry, RetryContext, RetryTask, SessionError};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::broadcast::{Subnets, UdpBroadcast};
use crate::error::DiscoveryError;
use crate::udp_server::{Datagram, DatagramHandler, UdpConfig, UdpServer, DEFAULT_RECEIVE_BUFFER_SIZE};

/// Prefix every discovery request and response starts with
pub const MAGIC: [u8; 9] = [62, 126, 239, 61, 127, 240, 63, 125, 238];

/// Default discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 54777;

/// Default time to wait for a reply
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Default delay between periodic discovery rounds
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(6);

/// Whether `packet` starts with [`MAGIC`]
pub fn is_valid(packet: &[u8]) -> bool {
    packet.starts_with(&MAGIC)
}

/// Decides which requests a [`BroadcastServer`] answers, and with what
pub trait DiscoveryResponder: Send + Sync + 'static {
    /// Whether the request deserves a reply
    fn validate(&self, request: &[u8]) -> bool {
        is_valid(request)
    }

    /// Reply for a validated request
    fn response(&self, _request: &Datagram<'_>) -> Bytes {
        Bytes::from_static(&MAGIC)
    }
}

/// Answers every magic-prefixed request with the bare prefix
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicResponder;

impl DiscoveryResponder for MagicResponder {}

struct Responder {
    category: String,
    responder: Arc<dyn DiscoveryResponder>,
}

#[async_trait]
impl DatagramHandler for Responder {
    async fn received(&self, socket: &UdpSocket, datagram: Datagram<'_>) -> anyhow::Result<()> {
        if !self.responder.validate(datagram.data) {
            debug!(component = %self.category, "Server received invalid packet from {}", datagram.source);
            return Ok(());
        }
        let response = self.responder.response(&datagram);
        socket.send_to(&response, datagram.source).await?;
        debug!(component = %self.category, "Answered discovery request from {}", datagram.source);
        Ok(())
    }
}

/// UDP server answering discovery requests
pub struct BroadcastServer {
    server: UdpServer,
}

impl BroadcastServer {
    /// Server answering with [`MagicResponder`]
    pub fn new(category: impl Into<String>, name: impl Into<String>, config: UdpConfig) -> Self {
        Self::with_responder(category, name, config, Arc::new(MagicResponder))
    }

    /// Server answering through a custom responder
    pub fn with_responder(
        category: impl Into<String>,
        name: impl Into<String>,
        config: UdpConfig,
        responder: Arc<dyn DiscoveryResponder>,
    ) -> Self {
        let category = category.into();
        let handler = Arc::new(Responder {
            category: category.clone(),
            responder,
        });
        Self {
            server: UdpServer::new(category, name, config, handler),
        }
    }

    /// Underlying UDP server
    pub fn udp(&self) -> &UdpServer {
        &self.server
    }

    /// Start answering
    pub async fn start(&self) {
        self.server.start().await;
    }

    /// Stop answering
    pub async fn stop(&self) -> bool {
        self.server.stop().await
    }

    /// Wait for the server loop to exit
    pub async fn wait(&self) -> Result<(), Arc<SessionError>> {
        self.server.wait().await
    }

    /// Wait until the socket is bound (zero waits forever)
    pub async fn wait_for_listening(&self, timeout: Duration) -> Option<SocketAddr> {
        self.server.wait_for_listening(timeout).await
    }
}

/// A valid discovery reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Address of the answering server
    pub source: SocketAddr,
    /// Full reply, magic prefix included
    pub data: Bytes,
}

/// Periodic discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port servers listen on
    pub port: u16,
    /// Time to wait for a reply (zero waits forever)
    pub timeout: Duration,
    /// Broadcast address granularity
    pub subnets: Subnets,
    /// Fixed target address instead of subnet broadcast
    pub address: Option<IpAddr>,
    /// Delays between rounds
    pub retry_delays: Vec<Duration>,
    /// Bytes appended to the magic prefix of each request
    pub request: Vec<u8>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            subnets: Subnets::default(),
            address: None,
            retry_delays: vec![DEFAULT_DISCOVERY_INTERVAL],
            request: Vec::new(),
        }
    }
}

/// Notified by a periodic [`BroadcastClient`]
pub trait DiscoveryListener: Send + Sync + 'static {
    /// A server answered
    fn found(&self, discovered: &Discovered);
}

async fn receive_valid(
    category: &str,
    socket: &UdpSocket,
    deadline: Option<Instant>,
) -> Result<Option<Discovered>, DiscoveryError> {
    let mut buffer = vec![0u8; DEFAULT_RECEIVE_BUFFER_SIZE];
    loop {
        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Ok(received) => received?,
                Err(_) => {
                    info!(component = %category, "Host discovery timed out.");
                    return Ok(None);
                }
            },
            None => socket.recv_from(&mut buffer).await?,
        };

        let (len, source) = received;
        let data = &buffer[..len];
        if !is_valid(data) {
            debug!(component = %category, "Received invalid packet from {}", source);
            continue;
        }
        info!(component = %category, "Discovered server: {}", source);
        return Ok(Some(Discovered {
            source,
            data: Bytes::copy_from_slice(data),
        }));
    }
}

struct ClientInner {
    category: String,
    config: DiscoveryConfig,
    listener: Arc<dyn DiscoveryListener>,
    broadcast: tokio::sync::Mutex<UdpBroadcast>,
}

#[async_trait]
impl Retry for ClientInner {
    async fn retry(&self, ctx: &RetryContext) -> Result<(), SessionError> {
        let mut broadcast = self.broadcast.lock().await;
        let outcome = tokio::select! {
            found = BroadcastClient::find(
                &self.category,
                &mut *broadcast,
                self.config.port,
                self.config.timeout,
                &self.config.request,
            ) => Some(found),
            _ = ctx.stopped() => None,
        };
        broadcast.close();
        drop(broadcast);

        match outcome {
            Some(Ok(Some(discovered))) => self.listener.found(&discovered),
            Some(Ok(None)) | None => {}
            Some(Err(e)) => return Err(SessionError::Fatal(e.to_string())),
        }
        ctx.failed();
        Ok(())
    }
}

/// Finds discovery servers, once or periodically
pub struct BroadcastClient {
    task: RetryTask,
}

impl BroadcastClient {
    /// Periodic discovery reporting every reply to `listener`
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        config: DiscoveryConfig,
        listener: Arc<dyn DiscoveryListener>,
    ) -> Self {
        let category = category.into();
        let delays = config.retry_delays.clone();
        let broadcast = match config.address {
            Some(address) => UdpBroadcast::with_address(address),
            None => UdpBroadcast::new(config.subnets),
        };
        let inner = Arc::new(ClientInner {
            category: category.clone(),
            broadcast: tokio::sync::Mutex::new(broadcast),
            config,
            listener,
        });
        let task = RetryTask::new(category, name, inner);
        task.set_retry_delays(&delays);
        task.set_daemon(true);
        Self { task }
    }

    /// Start the discovery loop
    pub async fn start(&self) {
        self.task.start().await;
    }

    /// Stop the discovery loop
    pub async fn stop(&self) -> bool {
        self.task.stop().await
    }

    /// Wait for the discovery loop to exit
    pub async fn wait(&self) -> Result<(), Arc<SessionError>> {
        self.task.wait().await
    }

    /// Whether the discovery loop is running
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Completed rounds since the loop started
    pub fn rounds(&self) -> usize {
        self.task.retry_count()
    }

    /// Broadcast one request on `port` and return the first valid reply.
    ///
    /// Invalid replies are skipped until `timeout` (zero waits forever).
    /// Socket and send failures are logged and reported as `Ok(None)`;
    /// only a broadcaster that is already bound is an error.
    pub async fn find(
        category: &str,
        broadcast: &mut UdpBroadcast,
        port: u16,
        timeout: Duration,
        request: &[u8],
    ) -> Result<Option<Discovered>, DiscoveryError> {
        match broadcast.bind().await {
            Ok(()) => {}
            Err(DiscoveryError::AlreadyBound) => return Err(DiscoveryError::AlreadyBound),
            Err(e) => {
                error!(component = %category, "Host discovery failed: {}", e);
                return Ok(None);
            }
        }

        let result = Self::exchange(category, broadcast, port, timeout, request).await;
        broadcast.close();
        match result {
            Ok(found) => Ok(found),
            Err(e) => {
                error!(component = %category, "Host discovery failed: {}", e);
                Ok(None)
            }
        }
    }

    async fn exchange(
        category: &str,
        broadcast: &UdpBroadcast,
        port: u16,
        timeout: Duration,
        request: &[u8],
    ) -> Result<Option<Discovered>, DiscoveryError> {
        let socket = broadcast.socket().ok_or(DiscoveryError::NotBound)?;
        let mut packet = Vec::with_capacity(MAGIC.len() + request.len());
        packet.extend_from_slice(&MAGIC);
        packet.extend_from_slice(request);

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        broadcast.broadcast(port, &packet).await?;
        debug!(component = %category, "Broadcasted on port: UDP {}", port);

        receive_valid(category, &socket, deadline).await
    }
}
