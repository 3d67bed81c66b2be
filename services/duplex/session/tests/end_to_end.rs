use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duplex_session::{
    ClientConfig, ClientHandler, Connection, DefaultProtocol, Protocol, ServerConfig, ServerHandler, TcpClient,
    TcpServer, TextProtocol,
};
use duplex_wire::Message;
use tokio::sync::mpsc;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);

fn fast_retries() -> Vec<Duration> {
    vec![Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(40)]
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Replies `pong <payload>` to `ping <payload>` and echoes binary payloads
#[derive(Default)]
struct PongServer {
    new_connections: AtomicUsize,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    received: parking_lot::Mutex<Vec<Message>>,
}

#[async_trait]
impl ServerHandler for PongServer {
    fn new_connection(&self, _connection: &Connection) {
        self.new_connections.fetch_add(1, Ordering::SeqCst);
    }

    async fn connected(&self, _connection: &Connection) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self, _connection: &Connection) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()> {
        self.received.lock().push(message.clone());
        match message.event() {
            "ping" if message.payload().is_empty() => {
                connection.send("pong").await;
            }
            "ping" => {
                connection.send(format!("pong {}", message.payload())).await;
            }
            "echo" => {
                connection.send_bytes("echo", message.bytes()).await;
            }
            _ => {}
        }
        Ok(())
    }
}

struct Collector {
    messages: mpsc::UnboundedSender<Message>,
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl Collector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Self {
            messages: tx,
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
        });
        (collector, rx)
    }
}

#[async_trait]
impl ClientHandler for Collector {
    async fn connected(&self, _connection: &Connection) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnected(&self, _connection: &Connection) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn receive(&self, _connection: &Connection, message: Message) -> anyhow::Result<()> {
        let _ = self.messages.send(message);
        Ok(())
    }
}

async fn start_server(protocol: Arc<dyn Protocol>, handler: Arc<dyn ServerHandler>) -> (TcpServer, u16) {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        retry_delays: fast_retries(),
        ..ServerConfig::default()
    };
    let server = TcpServer::new("server", "Server", config, protocol, handler);
    server.start().await;
    let addr = server.wait_for_listening(WAIT).await.expect("server should listen");
    (server, addr.port())
}

fn client(port: u16, protocol: Arc<dyn Protocol>, handler: Arc<dyn ClientHandler>) -> TcpClient {
    let config = ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout: Duration::from_secs(1),
        retry_delays: fast_retries(),
        ..ClientConfig::default()
    };
    TcpClient::new("client", "Client", config, protocol, handler)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("message not received in time")
        .expect("collector dropped")
}

#[tokio::test]
async fn test_ping_pong() {
    let handler = Arc::new(PongServer::default());
    let (server, port) = start_server(Arc::new(DefaultProtocol::new()), handler.clone()).await;

    let (collector, mut rx) = Collector::new();
    let client = client(port, Arc::new(DefaultProtocol::new()), collector.clone());
    client.start().await;
    assert!(client.wait_for_connection(WAIT).await);

    assert!(client.send("ping hello").await);
    let reply = next(&mut rx).await;
    assert_eq!(reply.event(), "pong");
    assert_eq!(reply.payload(), "hello");
    assert_eq!(reply.count(), 0);

    assert_eq!(handler.new_connections.load(Ordering::SeqCst), 1);
    assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
    assert_eq!(collector.connected.load(Ordering::SeqCst), 1);

    assert!(client.stop().await);
    assert!(client.wait_for_close(WAIT).await);
    eventually(|| handler.disconnected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(collector.disconnected.load(Ordering::SeqCst), 1);
    assert!(server.stop().await);
}

#[tokio::test]
async fn test_ping_with_payload_gets_empty_pong() {
    let handler = Arc::new(PongServer::default());
    let (server, port) = start_server(Arc::new(DefaultProtocol::new()), handler.clone()).await;

    let (collector, mut rx) = Collector::new();
    let client = client(port, Arc::new(DefaultProtocol::new()), collector);
    client.start().await;
    assert!(client.wait_for_connection(WAIT).await);

    assert!(client.send_bytes("ping", &[1, 2, 3]).await);
    let reply = next(&mut rx).await;
    assert_eq!(reply.header(), "pong");
    assert_eq!(reply.count(), 0);

    {
        let received = handler.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].header(), "ping");
        assert_eq!(received[0].count(), 3);
        assert_eq!(&received[0].bytes()[..], &[1, 2, 3]);
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_payloads_arrive_intact_and_in_order() {
    let handler = Arc::new(PongServer::default());
    let (server, port) = start_server(Arc::new(DefaultProtocol::new()), handler).await;

    let (collector, mut rx) = Collector::new();
    let client = client(port, Arc::new(DefaultProtocol::new()), collector);
    client.start().await;
    assert!(client.wait_for_connection(WAIT).await);

    let sizes = [0usize, 1, 127, 128, 16_384, 70_000];
    for &size in &sizes {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        assert!(client.send_bytes("echo", &payload).await);
    }
    for &size in &sizes {
        let message = next(&mut rx).await;
        assert_eq!(message.header(), "echo");
        assert_eq!(message.count(), size);
        assert!(message.bytes().iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_client_without_listener_keeps_retrying() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let (collector, _rx) = Collector::new();
    let client = client(port, Arc::new(DefaultProtocol::new()), collector.clone());
    client.start().await;

    assert!(!client.wait_for_connection(Duration::from_millis(300)).await);
    assert!(client.retry_count() >= 2);
    assert!(client.connection().is_none());
    assert!(!client.send("ping lost").await);

    assert!(client.stop().await);
    assert!(!client.stop().await);
    assert_eq!(collector.connected.load(Ordering::SeqCst), 0);
}

/// Instant at which the client's backoff position first reaches `count`
async fn retry_reached(client: &TcpClient, count: usize) -> Instant {
    tokio::time::timeout(WAIT, async {
        while client.retry_count() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Instant::now()
    })
    .await
    .expect("retry count not reached in time")
}

#[tokio::test]
async fn test_client_backoff_follows_delay_sequence() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let delays = [Duration::from_millis(60), Duration::from_millis(120), Duration::from_millis(240)];
    let (collector, _rx) = Collector::new();
    let config = ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout: Duration::from_secs(1),
        retry_delays: delays.to_vec(),
        ..ClientConfig::default()
    };
    let client = TcpClient::new("client", "Client", config, Arc::new(DefaultProtocol::new()), collector.clone());
    client.start().await;

    let mut reached = Vec::new();
    for count in 1..=4 {
        reached.push(retry_reached(&client, count).await);
    }
    let gaps: Vec<Duration> = reached.windows(2).map(|w| w[1] - w[0]).collect();

    // each gap is one refused connect plus the next delay in the cycle
    let slack = Duration::from_millis(10);
    assert!(gaps[0] + slack >= delays[1], "gaps {:?}", gaps);
    assert!(gaps[1] + slack >= delays[2], "gaps {:?}", gaps);
    assert!(gaps[2] + slack >= delays[0], "gaps {:?}", gaps);
    assert!(gaps[1] > gaps[0], "gaps {:?}", gaps);
    assert!(gaps[2] < gaps[1], "gaps {:?}", gaps);

    assert!(client.stop().await);
    assert_eq!(collector.connected.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_server_stop_closes_every_connection() {
    let handler = Arc::new(PongServer::default());
    let (server, port) = start_server(Arc::new(DefaultProtocol::new()), handler.clone()).await;

    let (first, _rx1) = Collector::new();
    let (second, _rx2) = Collector::new();
    let client1 = client(port, Arc::new(DefaultProtocol::new()), first.clone());
    let client2 = client(port, Arc::new(DefaultProtocol::new()), second.clone());
    client1.start().await;
    client2.start().await;
    assert!(client1.wait_for_connection(WAIT).await);
    assert!(client2.wait_for_connection(WAIT).await);
    eventually(|| server.connections().len() == 2).await;

    assert!(server.send_blocking("ping all", &[]).await);
    assert!(server.stop().await);
    assert!(server.connections().is_empty());
    assert_eq!(handler.disconnected.load(Ordering::SeqCst), 2);
    assert!(server.local_addr().is_none());

    eventually(|| first.disconnected.load(Ordering::SeqCst) >= 1).await;
    eventually(|| second.disconnected.load(Ordering::SeqCst) >= 1).await;

    client1.stop().await;
    client2.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_drops_it() {
    let handler = Arc::new(PongServer::default());
    let (server, port) = start_server(Arc::new(DefaultProtocol::new()), handler.clone()).await;

    let (collector, mut rx) = Collector::new();
    let client = client(port, Arc::new(DefaultProtocol::new()), collector.clone());
    client.start().await;
    assert!(client.wait_for_connection(WAIT).await);
    eventually(|| server.connections().len() == 1).await;

    server.close_connections();
    eventually(|| collector.connected.load(Ordering::SeqCst) == 2).await;
    assert!(client.wait_for_connection(WAIT).await);

    assert!(client.send("ping again").await);
    assert_eq!(next(&mut rx).await.payload(), "again");
    assert_eq!(collector.disconnected.load(Ordering::SeqCst), 1);

    client.stop().await;
    server.stop().await;
}

/// Greets with a banner line, then answers every line with `good`
#[derive(Default)]
struct BannerServer {
    received: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl ServerHandler for BannerServer {
    async fn connected(&self, connection: &Connection) {
        connection.send("skip this hi\r\n").await;
        connection.send("moo\r\n").await;
        connection.send("ok?\r\n").await;
    }

    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()> {
        self.received.lock().push(message.header().to_string());
        connection.send("good\r\n").await;
        Ok(())
    }
}

#[tokio::test]
async fn test_text_protocol_with_preamble() {
    let handler = Arc::new(BannerServer::default());
    let (server, port) = start_server(Arc::new(TextProtocol::crlf()), handler.clone()).await;

    let (collector, mut rx) = Collector::new();
    let protocol = TextProtocol::crlf().with_preamble("hi\r\n");
    let client = client(port, Arc::new(protocol), collector);
    client.start().await;
    assert!(client.wait_for_connection(WAIT).await);

    assert_eq!(next(&mut rx).await.header(), "moo");
    assert_eq!(next(&mut rx).await.header(), "ok?");
    assert!(client.send("ok!\r\n").await);
    assert_eq!(next(&mut rx).await.header(), "good");
    assert_eq!(handler.received.lock().as_slice(), ["ok!"]);

    assert!(!client.send_bytes("file\r\n", b"nope").await);

    client.stop().await;
    server.stop().await;
}
