use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duplex_discovery::{
    BroadcastClient, BroadcastServer, Datagram, Discovered, DiscoveryConfig, DiscoveryError, DiscoveryListener,
    DiscoveryResponder, UdpBroadcast, UdpConfig, MAGIC,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> UdpBroadcast {
    UdpBroadcast::with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn start_server(server: BroadcastServer) -> (BroadcastServer, u16) {
    server.start().await;
    let addr = server.wait_for_listening(WAIT).await.expect("server should listen");
    (server, addr.port())
}

fn udp_config() -> UdpConfig {
    UdpConfig {
        host: "127.0.0.1".to_string(),
        ..UdpConfig::default()
    }
}

#[tokio::test]
async fn test_find_discovers_server() {
    let (server, port) = start_server(BroadcastServer::new("broadcast", "server", udp_config())).await;

    let mut broadcast = loopback();
    let found = BroadcastClient::find("broadcast", &mut broadcast, port, WAIT, &[])
        .await
        .unwrap()
        .expect("server should answer");
    assert_eq!(&found.data[..], &MAGIC[..]);
    assert_eq!(found.source.port(), port);
    assert!(!broadcast.is_bound());

    assert!(server.stop().await);
}

/// Echoes the request suffix back after the prefix, for requests ending in `!`
struct Echo;

impl DiscoveryResponder for Echo {
    fn validate(&self, request: &[u8]) -> bool {
        duplex_discovery::is_valid(request) && request.ends_with(b"!")
    }

    fn response(&self, request: &Datagram<'_>) -> Bytes {
        Bytes::copy_from_slice(request.data)
    }
}

#[tokio::test]
async fn test_custom_responder_sees_request_bytes() {
    let server = BroadcastServer::with_responder("broadcast", "echo", udp_config(), Arc::new(Echo));
    let (server, port) = start_server(server).await;

    let mut broadcast = loopback();
    let found = BroadcastClient::find("broadcast", &mut broadcast, port, WAIT, b"node-7!")
        .await
        .unwrap()
        .expect("server should answer");
    assert_eq!(&found.data[MAGIC.len()..], b"node-7!");

    let ignored = BroadcastClient::find("broadcast", &mut broadcast, port, Duration::from_millis(200), b"quiet")
        .await
        .unwrap();
    assert!(ignored.is_none());

    server.stop().await;
}

/// Answers with a truncated prefix
struct Truncated;

impl DiscoveryResponder for Truncated {
    fn response(&self, _request: &Datagram<'_>) -> Bytes {
        Bytes::copy_from_slice(&MAGIC[..5])
    }
}

#[tokio::test]
async fn test_invalid_reply_is_no_discovery() {
    let server = BroadcastServer::with_responder("broadcast", "bad", udp_config(), Arc::new(Truncated));
    let (server, port) = start_server(server).await;

    let mut broadcast = loopback();
    let found = BroadcastClient::find("broadcast", &mut broadcast, port, Duration::from_millis(300), &[])
        .await
        .unwrap();
    assert!(found.is_none());

    server.stop().await;
}

#[tokio::test]
async fn test_find_without_server_times_out() {
    let port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    let mut broadcast = loopback();
    let found = BroadcastClient::find("broadcast", &mut broadcast, port, Duration::from_millis(200), &[])
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_find_on_bound_broadcaster_is_rejected() {
    let mut broadcast = loopback();
    broadcast.bind().await.unwrap();
    let err = BroadcastClient::find("broadcast", &mut broadcast, 9, Duration::from_millis(50), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::AlreadyBound));
}

struct Found(mpsc::UnboundedSender<Discovered>);

impl DiscoveryListener for Found {
    fn found(&self, discovered: &Discovered) {
        let _ = self.0.send(discovered.clone());
    }
}

#[tokio::test]
async fn test_periodic_client_reports_each_round() {
    let (server, port) = start_server(BroadcastServer::new("broadcast", "server", udp_config())).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = DiscoveryConfig {
        port,
        timeout: Duration::from_secs(1),
        address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        retry_delays: vec![Duration::from_millis(20)],
        ..DiscoveryConfig::default()
    };
    let client = BroadcastClient::new("broadcast", "client", config, Arc::new(Found(tx)));
    client.start().await;

    for _ in 0..2 {
        let found = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&found.data[..], &MAGIC[..]);
    }
    assert!(client.rounds() >= 1);

    assert!(client.stop().await);
    assert!(!client.is_running());
    server.stop().await;
}
