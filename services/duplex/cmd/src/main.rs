//! Duplex node binary.
//!
//! Runs an echoing TCP server, an interactive TCP client, a discovery
//! responder or a discovery probe, depending on the subcommand.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use duplex_discovery::{BroadcastClient, BroadcastServer, Discovered, DiscoveryListener, UdpBroadcast};
use duplex_session::{ClientHandler, Connection, ServerHandler, TcpClient, TcpServer};
use duplex_wire::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::DuplexLogFormatter;

/// Duplex messaging node
#[derive(Parser, Debug)]
#[command(name = "duplex", version, about = "Duplex TCP messaging with UDP host discovery")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "duplex.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Listen address for serve, target host for connect
    #[arg(long)]
    host: Option<String>,

    /// TCP port
    #[arg(long)]
    port: Option<u16>,

    /// UDP discovery port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Connect timeout, e.g. 5s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Discovery reply timeout, e.g. 3s (0 waits forever)
    #[arg(long)]
    discovery_timeout: Option<humantime::Duration>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every message back
    Serve {
        /// Also answer discovery requests
        #[arg(long)]
        announce: bool,
    },
    /// Connect to a server and send each stdin line as a message
    Connect {
        /// Locate the server through discovery instead of --host
        #[arg(long)]
        discover: bool,
    },
    /// Answer discovery requests only
    Announce,
    /// Look for servers
    Discover {
        /// Keep probing and report every answer
        #[arg(long)]
        watch: bool,
        /// Probe one address instead of the local subnets
        #[arg(long)]
        address: Option<IpAddr>,
    },
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(host) = &self.host {
            config.tcp.host = host.clone();
        }
        if let Some(port) = self.port {
            config.tcp.port = port;
        }
        if let Some(port) = self.discovery_port {
            config.discovery.port = port;
        }
        if let Some(timeout) = self.connect_timeout {
            config.tcp.connect_timeout_ms = millis(timeout.into());
        }
        if let Some(timeout) = self.discovery_timeout {
            config.discovery.timeout_ms = millis(timeout.into());
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Echoes every message back to its sender
struct Echo {
    suffix: String,
}

#[async_trait]
impl ServerHandler for Echo {
    async fn receive(&self, connection: &Connection, message: Message) -> anyhow::Result<()> {
        debug!(component = "server", "{} -> {} ({} bytes)", connection.peer_addr(), message.header(), message.count());
        let header = format!("{}{}", message.header(), self.suffix);
        if message.count() > 0 {
            connection.send_bytes(header, message.bytes()).await;
        } else {
            connection.send(header).await;
        }
        Ok(())
    }
}

/// Prints every message received from the server
struct Printer;

#[async_trait]
impl ClientHandler for Printer {
    async fn receive(&self, _connection: &Connection, message: Message) -> anyhow::Result<()> {
        if message.count() > 0 {
            println!("{} [{} bytes]", message.header(), message.count());
        } else {
            println!("{}", message.header());
        }
        Ok(())
    }
}

/// Prints each discovered server
struct Report;

impl DiscoveryListener for Report {
    fn found(&self, discovered: &Discovered) {
        println!("{}", discovered.source.ip());
    }
}

async fn serve(config: &NodeConfig, announce: bool) -> anyhow::Result<()> {
    let echo = Arc::new(Echo {
        suffix: config.header_suffix().to_string(),
    });
    let server = TcpServer::new("server", "duplex", config.server_config(), config.protocol(), echo);
    server.start().await;

    let responder = if announce {
        let responder = BroadcastServer::new("broadcast", "duplex", config.udp_config());
        responder.start().await;
        Some(responder)
    } else {
        None
    };

    tokio::select! {
        result = server.wait() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
    }

    if let Some(responder) = responder {
        responder.stop().await;
    }
    server.stop().await;
    Ok(())
}

async fn connect(config: &mut NodeConfig, discover: bool) -> anyhow::Result<()> {
    if discover {
        let mut broadcast = UdpBroadcast::new(config.discovery.subnets);
        let discovery = config.discovery_config();
        match BroadcastClient::find("broadcast", &mut broadcast, discovery.port, discovery.timeout, &[]).await? {
            Some(found) => config.tcp.host = found.source.ip().to_string(),
            None => anyhow::bail!("no server answered on UDP port {}", discovery.port),
        }
    }

    let client = TcpClient::new("client", "duplex", config.client_config(), config.protocol(), Arc::new(Printer));
    client.start().await;

    let suffix = config.header_suffix();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !client.send(&format!("{}{}", line, suffix)).await {
                        warn!(component = "client", "Not connected, dropped: {}", line);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop().await;
    Ok(())
}

async fn announce(config: &NodeConfig) -> anyhow::Result<()> {
    let responder = BroadcastServer::new("broadcast", "duplex", config.udp_config());
    responder.start().await;

    tokio::select! {
        result = responder.wait() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
    }

    responder.stop().await;
    Ok(())
}

async fn discover(config: &NodeConfig, watch: bool, address: Option<IpAddr>) -> anyhow::Result<()> {
    let mut discovery = config.discovery_config();
    discovery.address = address;

    if watch {
        let client = BroadcastClient::new("broadcast", "duplex", discovery, Arc::new(Report));
        client.start().await;
        tokio::signal::ctrl_c().await?;
        client.stop().await;
        return Ok(());
    }

    let mut broadcast = match address {
        Some(address) => UdpBroadcast::with_address(address),
        None => UdpBroadcast::new(discovery.subnets),
    };
    match BroadcastClient::find("broadcast", &mut broadcast, discovery.port, discovery.timeout, &discovery.request).await? {
        Some(found) => Report.found(&found),
        None => anyhow::bail!("no server answered on UDP port {}", discovery.port),
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("duplex={}", args.log_level).parse()?)
        .add_directive(format!("duplex_session={}", args.log_level).parse()?)
        .add_directive(format!("duplex_discovery={}", args.log_level).parse()?)
        .add_directive(format!("duplex_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(DuplexLogFormatter::new("duplex"))
        .init();

    info!("Starting duplex v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    match args.command {
        Command::Serve { announce: with_responder } => serve(&config, with_responder).await,
        Command::Connect { discover: via_discovery } => connect(&mut config, via_discovery).await,
        Command::Announce => announce(&config).await,
        Command::Discover { watch, address } => discover(&config, watch, address).await,
    }
}
