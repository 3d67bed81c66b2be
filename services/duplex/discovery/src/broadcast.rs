//! Subnet broadcast over UDP.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::DiscoveryError;

/// Which trailing octets of each local address are set to 255
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subnets {
    /// Subnet mask 255.255.255.0
    #[default]
    ClassC,
    /// Subnet mask 255.255.0.0
    ClassB,
    /// Both subnet masks
    ClassBC,
}

impl Subnets {
    fn class_c(self) -> bool {
        matches!(self, Subnets::ClassC | Subnets::ClassBC)
    }

    fn class_b(self) -> bool {
        matches!(self, Subnets::ClassB | Subnets::ClassBC)
    }
}

/// Broadcast addresses for `locals`, deduplicated, in first-seen order
pub fn broadcast_addresses(locals: impl IntoIterator<Item = Ipv4Addr>, subnets: Subnets) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();
    for local in locals {
        let [a, b, c, _] = local.octets();
        let mut candidates = Vec::with_capacity(2);
        if subnets.class_c() {
            candidates.push(Ipv4Addr::new(a, b, c, 255));
        }
        if subnets.class_b() {
            candidates.push(Ipv4Addr::new(a, b, 255, 255));
        }
        for candidate in candidates {
            if seen.insert(candidate) {
                addresses.push(IpAddr::V4(candidate));
            }
        }
    }
    addresses
}

/// Non-loopback IPv4 addresses of the local interfaces.
///
/// `if-addrs` reports no link state, so an interface that is down but
/// still holds an address is listed too; sends to it fail and
/// [`UdpBroadcast::broadcast`] carries on with the other addresses.
fn interface_addresses() -> io::Result<Vec<Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs()?;
    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect())
}

/// A broadcast-capable UDP socket and the addresses it sends to
#[derive(Debug)]
pub struct UdpBroadcast {
    subnets: Option<Subnets>,
    addresses: Vec<IpAddr>,
    socket: Option<Arc<UdpSocket>>,
}

impl UdpBroadcast {
    /// Send to the broadcast addresses of every local IPv4 interface
    pub fn new(subnets: Subnets) -> Self {
        Self {
            subnets: Some(subnets),
            addresses: Vec::new(),
            socket: None,
        }
    }

    /// Send to one fixed address only
    pub fn with_address(address: IpAddr) -> Self {
        Self {
            subnets: None,
            addresses: vec![address],
            socket: None,
        }
    }

    /// Re-enumerate local interfaces. Does nothing for a fixed address.
    pub fn update_addresses(&mut self) -> Result<(), DiscoveryError> {
        if let Some(subnets) = self.subnets {
            self.addresses = broadcast_addresses(interface_addresses()?, subnets);
            trace!("Broadcast addresses: {:?}", self.addresses);
        }
        Ok(())
    }

    /// Current target addresses
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Bind an ephemeral broadcast socket, enumerating interfaces first if needed
    pub async fn bind(&mut self) -> Result<(), DiscoveryError> {
        if self.socket.is_some() {
            return Err(DiscoveryError::AlreadyBound);
        }
        if self.addresses.is_empty() {
            self.update_addresses()?;
        }
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_broadcast(true)?;
        self.socket = Some(Arc::new(socket));
        Ok(())
    }

    /// Send `buffer` to `port` on every address. Succeeds when at least one send does.
    pub async fn broadcast(&self, port: u16, buffer: &[u8]) -> Result<(), DiscoveryError> {
        let socket = self.socket.as_ref().ok_or(DiscoveryError::NotBound)?;

        let mut sent = false;
        let mut last_error = None;
        for address in &self.addresses {
            match socket.send_to(buffer, SocketAddr::new(*address, port)).await {
                Ok(_) => sent = true,
                Err(e) => {
                    trace!("Broadcast to {} failed: {}", address, e);
                    last_error = Some(e);
                }
            }
        }

        match (sent, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(DiscoveryError::Io(e)),
            (false, None) => Err(DiscoveryError::NoAddresses),
        }
    }

    /// Bound socket, for receiving replies
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    /// Whether a socket is bound
    pub fn is_bound(&self) -> bool {
        self.socket.is_some()
    }

    /// Release the socket. Safe to call when unbound.
    pub fn close(&mut self) {
        self.socket = None;
    }
}
