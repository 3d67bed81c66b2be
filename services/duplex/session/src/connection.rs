//! Duplex TCP connections.
//!
//! A [`Connection`] wraps one TCP stream with a read task, which runs the
//! protocol's read loop and hands each message to the owner's
//! [`ConnectionHandler`], and a write task draining a bounded queue of
//! outbound messages. Direct writes through [`Connection::send_blocking`]
//! and the write task share one output lock, so encoded messages are never
//! interleaved on the wire.
//!
//! Closing is idempotent: the first `close` releases the stream, wakes both
//! tasks and notifies the owner; later calls do nothing.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use duplex_wire::Message;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::SessionError;
use crate::protocol::Protocol;

/// Default bound of the outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound messages queued before `send` waits for room
    pub queue_capacity: usize,
    /// Close the connection when a read waits longer than this
    pub read_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_timeout: None,
        }
    }
}

/// Owner side of a connection: receives its messages and its closure
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle one inbound message. An error closes the connection.
    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()>;

    /// Called exactly once, from the first `close`
    fn closed(&self, _connection: &Connection) {}
}

struct Outbound {
    header: String,
    bytes: Bytes,
}

struct Inner {
    id: u64,
    category: String,
    name: String,
    peer: SocketAddr,
    local: SocketAddr,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn ConnectionHandler>,
    config: ConnectionConfig,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    queue_tx: mpsc::Sender<Outbound>,
    queue_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    attachment: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Handle to one duplex TCP connection; clones share the connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Wrap an established stream. Nothing is read or written until [`Connection::start`].
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        stream: TcpStream,
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (close_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                category: category.into(),
                name: name.into(),
                peer,
                local,
                protocol,
                handler,
                config,
                closed: AtomicBool::new(false),
                close_tx,
                reader: Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(Some(writer)),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                attachment: Mutex::new(None),
            }),
        })
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Log category
    pub fn category(&self) -> &str {
        &self.inner.category
    }

    /// Name of the owning server or client
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Local address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection is closed
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.close_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Attach an application value, replacing any previous one
    pub fn set_attachment<T: Any + Send + Sync>(&self, value: Arc<T>) {
        *self.inner.attachment.lock() = Some(value as Arc<dyn Any + Send + Sync>);
    }

    /// Attached value, if one of type `T` is set
    pub fn attachment<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.inner.attachment.lock().clone()?;
        value.downcast::<T>().ok()
    }

    /// Spawn the read and write tasks. Only the first call has an effect.
    pub fn start(&self) {
        let reader = self.inner.reader.lock().take();
        let queue = self.inner.queue_rx.lock().take();
        let (Some(reader), Some(queue)) = (reader, queue) else {
            warn!(component = %self.inner.category, "Connection to {} already started or closed", self.inner.peer);
            return;
        };
        tokio::spawn(self.clone().read_task(reader));
        tokio::spawn(self.clone().write_task(queue));
    }

    /// Queue a header-only message, waiting for room if the queue is full.
    ///
    /// Returns false if the connection is closed.
    pub async fn send(&self, header: impl Into<String>) -> bool {
        self.enqueue(header.into(), Bytes::new()).await
    }

    /// Queue a message with a binary payload (copied)
    pub async fn send_bytes(&self, header: impl Into<String>, bytes: &[u8]) -> bool {
        let header = header.into();
        if !self.accepts_payload(&header, bytes) {
            return false;
        }
        self.enqueue(header, Bytes::copy_from_slice(bytes)).await
    }

    /// Queue a header-only message without waiting; false if closed or full
    pub fn try_send(&self, header: impl Into<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        let outbound = Outbound {
            header: header.into(),
            bytes: Bytes::new(),
        };
        match self.inner.queue_tx.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(outbound)) => {
                warn!(component = %self.inner.category, "Send queue to {} is full, dropping: {}", self.inner.peer, outbound.header);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Encode and write a message now, under the output lock.
    ///
    /// Returns false if the connection is closed or the write fails; a
    /// failed write closes the connection.
    pub async fn send_blocking(&self, header: &str, bytes: &[u8]) -> bool {
        if self.is_closed() {
            debug!(component = %self.inner.category, "Unable to send, connection is closed: {}", header);
            return false;
        }
        if !self.accepts_payload(header, bytes) {
            return false;
        }
        let mut frame = BytesMut::new();
        if let Err(e) = self.inner.protocol.encode(header, bytes, &mut frame) {
            error!(component = %self.inner.category, "Unable to encode {}: {}", header, e);
            return false;
        }

        let mut writer = self.inner.writer.lock().await;
        if self.is_closed() {
            return false;
        }
        let Some(stream) = writer.as_mut() else {
            return false;
        };
        let written = tokio::select! {
            result = write_frame(stream, &frame) => result,
            _ = self.wait_closed() => Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        };

        match written {
            Ok(()) => {
                if bytes.is_empty() {
                    trace!(component = %self.inner.category, "Sent: {}", header);
                } else {
                    trace!(component = %self.inner.category, "Sent: {} (+{} bytes)", header, bytes.len());
                }
                true
            }
            Err(e) => {
                if !self.is_closed() {
                    error!(component = %self.inner.category, "Error writing to {}: {}", self.inner.peer, e);
                }
                writer.take();
                drop(writer);
                self.close();
                false
            }
        }
    }

    /// Close the connection. Only the first call has an effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(component = %self.inner.category, "Disconnected: {}", self.inner.peer);
        self.inner.close_tx.send_replace(true);
        self.inner.reader.lock().take();
        self.inner.queue_rx.lock().take();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        self.inner.handler.closed(self);
    }

    /// Hand a decoded message to the owner. Used by protocol read loops.
    pub async fn deliver(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if message.count() == 0 {
            trace!(component = %self.inner.category, "Received: {}", message.header());
        } else {
            trace!(component = %self.inner.category, "Received: {} (+{} bytes)", message.header(), message.count());
        }
        let header = message.header().to_string();
        self.inner
            .handler
            .receive(self, message)
            .await
            .map_err(|error| SessionError::Handler { header, error })
    }

    /// Read into `buf`, returning 0 at end of stream. Used by protocol read loops.
    ///
    /// Fails with [`SessionError::Closed`] as soon as the connection closes.
    pub async fn read_buf(&self, reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> Result<usize, SessionError> {
        self.interruptible(reader.read_buf(buf)).await
    }

    /// Read into a plain slice, returning 0 at end of stream
    pub async fn read(&self, reader: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.interruptible(reader.read(buf)).await
    }

    async fn interruptible<F>(&self, read: F) -> Result<usize, SessionError>
    where
        F: Future<Output = io::Result<usize>>,
    {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let timed = async {
            match self.inner.config.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, read)
                    .await
                    .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))),
                None => read.await,
            }
        };
        tokio::select! {
            result = timed => Ok(result?),
            _ = self.wait_closed() => Err(SessionError::Closed),
        }
    }

    fn accepts_payload(&self, header: &str, bytes: &[u8]) -> bool {
        if bytes.is_empty() || self.inner.protocol.carries_bytes() {
            return true;
        }
        error!(component = %self.inner.category, "{}: {}", SessionError::PayloadUnsupported, header);
        false
    }

    async fn enqueue(&self, header: String, bytes: Bytes) -> bool {
        if self.is_closed() {
            debug!(component = %self.inner.category, "Unable to send, connection is closed: {}", header);
            return false;
        }
        trace!(component = %self.inner.category, "Queued: {}", header);
        self.inner.queue_tx.send(Outbound { header, bytes }).await.is_ok()
    }

    async fn read_task(self, mut reader: OwnedReadHalf) {
        trace!(component = %self.inner.category, "Started read task for {}", self.inner.peer);
        let protocol = self.inner.protocol.clone();
        match protocol.read(&self, &mut reader).await {
            Ok(()) => debug!(component = %self.inner.category, "End of stream from {}", self.inner.peer),
            Err(SessionError::Closed) => {}
            Err(e) if self.is_closed() => {
                debug!(component = %self.inner.category, "Read from {} ended after close: {}", self.inner.peer, e)
            }
            Err(e) => error!(component = %self.inner.category, "Error reading from {}: {}", self.inner.peer, e),
        }
        drop(reader);
        self.close();
        trace!(component = %self.inner.category, "Stopped read task for {}", self.inner.peer);
    }

    async fn write_task(self, mut queue: mpsc::Receiver<Outbound>) {
        trace!(component = %self.inner.category, "Started write task for {}", self.inner.peer);
        loop {
            let outbound = tokio::select! {
                biased;
                _ = self.wait_closed() => break,
                outbound = queue.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
            };
            if !self.send_blocking(&outbound.header, &outbound.bytes).await && self.is_closed() {
                break;
            }
        }
        drop(queue);

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.close();
        trace!(component = %self.inner.category, "Stopped write task for {}", self.inner.peer);
    }
}

async fn write_frame(stream: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
