//! TCP transport for duplex connections.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::error::SessionError;

/// Create a TCP listener bound to `host:port`
pub async fn listen_tcp(host: &str, port: u16) -> tokio::io::Result<TcpListener> {
    TcpListener::bind((host, port)).await
}

/// Connect to `host:port`, giving up after `timeout` (zero waits forever)
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, SessionError> {
    let connect = TcpStream::connect((host, port));
    let stream = if timeout.is_zero() {
        connect.await?
    } else {
        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    addr: format!("{}:{}", host, port),
                    timeout,
                })
            }
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
