//! Configuration handling for the duplex node.
//!
//! Settings come from a YAML file, then `DUPLEX_*` environment variables,
//! then command-line flags (applied in `main`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use duplex_discovery::{DiscoveryConfig, Subnets, UdpConfig, DEFAULT_DISCOVERY_PORT};
use duplex_session::{
    ClientConfig, ConnectionConfig, DefaultProtocol, Protocol, ServerConfig, TextProtocol, DEFAULT_QUEUE_CAPACITY,
};
use duplex_wire::{Charset, DEFAULT_MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Node configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP server and client settings
    pub tcp: TcpSettings,
    /// Message framing
    pub protocol: ProtocolSettings,
    /// UDP discovery settings
    pub discovery: DiscoverySettings,
}

/// TCP settings shared by `serve` and `connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Listen address for `serve`, target host for `connect`
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// 0 disables the read timeout
    pub read_timeout_ms: u64,
    pub queue_capacity: usize,
    pub retry_delays_ms: Vec<u64>,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4567,
            connect_timeout_ms: 5000,
            read_timeout_ms: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_delays_ms: vec![1000, 3000, 5000, 8000, 13000],
        }
    }
}

/// Which framing to speak
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[default]
    Default,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSettings {
    pub kind: ProtocolKind,
    pub charset: Charset,
    pub delimiter: String,
    /// Text framing only: skip input through this marker first
    pub preamble: Option<String>,
    pub max_payload_size: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            kind: ProtocolKind::Default,
            charset: Charset::Utf8,
            delimiter: "\n".to_string(),
            preamble: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub port: u16,
    pub timeout_ms: u64,
    pub subnets: Subnets,
    pub interval_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            timeout_ms: 3000,
            subnets: Subnets::ClassC,
            interval_ms: 6000,
        }
    }
}

impl NodeConfig {
    /// Load from `path`, falling back to defaults, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<NodeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}, using defaults: {}", path, e);
                    NodeConfig::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                NodeConfig::default()
            }
        };

        config.apply_environment_overrides();
        config.clamp_discovery_interval();
        Ok(config)
    }

    /// A zero interval would end periodic discovery after one round
    fn clamp_discovery_interval(&mut self) {
        if self.discovery.interval_ms == 0 {
            let default = DiscoverySettings::default().interval_ms;
            warn!("Discovery interval of 0ms is not allowed, using {}ms", default);
            self.discovery.interval_ms = default;
        }
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `DUPLEX_*` overrides read through `lookup`; unparsable values are ignored
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("DUPLEX_HOST") {
            info!("Host overridden by environment: {}", host);
            self.tcp.host = host;
        }

        if let Some(port) = lookup("DUPLEX_PORT").and_then(|v| v.parse::<u16>().ok()) {
            info!("Port overridden by environment: {}", port);
            self.tcp.port = port;
        }

        if let Some(port) = lookup("DUPLEX_DISCOVERY_PORT").and_then(|v| v.parse::<u16>().ok()) {
            info!("Discovery port overridden by environment: {}", port);
            self.discovery.port = port;
        }

        if let Some(ms) = lookup("DUPLEX_CONNECT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            info!("Connect timeout overridden by environment: {}ms", ms);
            self.tcp.connect_timeout_ms = ms;
        }
    }

    fn retry_delays(&self) -> Vec<Duration> {
        self.tcp.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
    }

    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            queue_capacity: self.tcp.queue_capacity,
            read_timeout: (self.tcp.read_timeout_ms > 0).then(|| Duration::from_millis(self.tcp.read_timeout_ms)),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.tcp.host.clone(),
            port: self.tcp.port,
            connection: self.connection(),
            retry_delays: self.retry_delays(),
            daemon: false,
        }
    }

    /// Client settings; the wildcard listen address connects to localhost
    pub fn client_config(&self) -> ClientConfig {
        let host = match self.tcp.host.as_str() {
            "0.0.0.0" | "" => "localhost".to_string(),
            host => host.to_string(),
        };
        ClientConfig {
            host,
            port: self.tcp.port,
            connect_timeout: Duration::from_millis(self.tcp.connect_timeout_ms),
            connection: self.connection(),
            retry_delays: self.retry_delays(),
            daemon: false,
        }
    }

    pub fn protocol(&self) -> Arc<dyn Protocol> {
        let settings = &self.protocol;
        match settings.kind {
            ProtocolKind::Default => Arc::new(DefaultProtocol::with_max_payload_size(settings.max_payload_size)),
            ProtocolKind::Text => {
                let text = TextProtocol::new(settings.charset, settings.delimiter.clone());
                match &settings.preamble {
                    Some(marker) => Arc::new(text.with_preamble(marker.clone())),
                    None => Arc::new(text),
                }
            }
        }
    }

    /// Text appended to outgoing headers; text framing needs its delimiter
    pub fn header_suffix(&self) -> &str {
        match self.protocol.kind {
            ProtocolKind::Default => "",
            ProtocolKind::Text => &self.protocol.delimiter,
        }
    }

    /// UDP responder bound to the discovery port
    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            port: self.discovery.port,
            retry_delays: self.retry_delays(),
            ..UdpConfig::default()
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            port: self.discovery.port,
            timeout: Duration::from_millis(self.discovery.timeout_ms),
            subnets: self.discovery.subnets,
            retry_delays: vec![Duration::from_millis(self.discovery.interval_ms)],
            ..DiscoveryConfig::default()
        }
    }
}
