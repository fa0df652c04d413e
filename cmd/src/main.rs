//! Demo endpoints for the wireline session library.
//!
//! Subcommands cover the library surface end to end: a TCP/TLS echo
//! server, an echo client, a UDP echo responder, and a deadline-bounded
//! HTTP GET.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use wireline_executor::Executor;
use wireline_http::{HttpClientEx, HttpRequest};
use wireline_session::{
    tls, Client, ClientConfig, Server, ServerConfig, Session, SessionEvents, SessionSettings,
    UdpConfig, UdpEndpoint, UdpEvents,
};

mod config;
mod logging;

use config::WirelineConfig;

/// Transport session demo endpoints.
#[derive(Parser, Debug)]
#[command(name = "wireline", version, about = "Transport session demo endpoints")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "wireline.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Echo every received byte back to its sender over TCP (or TLS).
    EchoServer {
        /// Listen address, overrides the config file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Send messages to an echo server and print what comes back.
    EchoClient {
        /// Connect address, overrides the config file
        #[arg(long)]
        connect: Option<SocketAddr>,
        /// Message to send
        #[arg(long, default_value = "hello wireline")]
        message: String,
        /// How many times to send it
        #[arg(long, default_value = "3")]
        count: usize,
        /// Pause between sends, e.g. 250ms
        #[arg(long, default_value = "250ms")]
        interval: humantime::Duration,
    },
    /// Echo datagrams back to their sender over UDP.
    UdpEcho {
        /// Listen address, overrides the config file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Issue a GET request with a deadline.
    HttpGet {
        /// Server address, overrides the config file connect address
        #[arg(long)]
        address: Option<SocketAddr>,
        /// Request target
        #[arg(long, default_value = "/")]
        target: String,
        /// Request deadline, e.g. 30s
        #[arg(long, default_value = "1m")]
        timeout: humantime::Duration,
        /// Server name for TLS verification; enables HTTPS
        #[arg(long)]
        tls_sni: Option<String>,
    },
}

struct Echo {
    session: Arc<Session>,
}

impl SessionEvents for Echo {
    fn on_connected(&mut self) {
        info!(session = %self.session.id(), peer = %self.session.peer_addr(), "connected");
    }

    fn on_received(&mut self, data: &[u8]) {
        self.session.send(data);
    }

    fn on_disconnected(&mut self) {
        info!(
            session = %self.session.id(),
            bytes_in = self.session.bytes_received(),
            bytes_out = self.session.bytes_sent(),
            "disconnected"
        );
    }
}

struct Printer;

impl SessionEvents for Printer {
    fn on_received(&mut self, data: &[u8]) {
        info!("received: {}", String::from_utf8_lossy(data));
    }

    fn on_error(&mut self, error: &wireline_session::Error) {
        tracing::error!(%error, "session error");
    }
}

struct UdpEcho {
    endpoint: Option<Arc<UdpEndpoint>>,
}

impl UdpEvents for UdpEcho {
    fn on_received(&mut self, from: SocketAddr, data: &[u8]) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.send_to(from, data);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;
    let config = WirelineConfig::load_from_file(&args.config)?;

    let executor = Executor::current();
    match args.command {
        Command::EchoServer { listen } => echo_server(executor, &config, listen).await,
        Command::EchoClient {
            connect,
            message,
            count,
            interval,
        } => echo_client(executor, &config, connect, &message, count, *interval).await,
        Command::UdpEcho { listen } => udp_echo(executor, &config, listen).await,
        Command::HttpGet {
            address,
            target,
            timeout,
            tls_sni,
        } => http_get(executor, &config, address, &target, *timeout, tls_sni).await,
    }
}

fn parse_addr(cli: Option<SocketAddr>, configured: &str) -> Result<SocketAddr> {
    match cli {
        Some(addr) => Ok(addr),
        None => configured
            .parse()
            .with_context(|| format!("invalid address: {configured}")),
    }
}

fn session_settings(config: &WirelineConfig) -> SessionSettings {
    SessionSettings {
        chunk_size: config.chunk_size,
        ..SessionSettings::default()
    }
}

async fn echo_server(
    executor: Executor,
    config: &WirelineConfig,
    listen: Option<SocketAddr>,
) -> Result<()> {
    let mut server_config = ServerConfig::new(parse_addr(listen, &config.listen)?);
    server_config.no_delay = config.no_delay;
    server_config.session = session_settings(config);

    let mut server = Server::new(
        executor,
        server_config,
        Arc::new(|session| Box::new(Echo { session })),
    );
    if config.tls.enabled {
        let cert_pem = std::fs::read_to_string(&config.tls.cert_file)
            .with_context(|| format!("reading {}", config.tls.cert_file))?;
        let key_pem = std::fs::read_to_string(&config.tls.key_file)
            .with_context(|| format!("reading {}", config.tls.key_file))?;
        let tls_config = tls::make_server_config(&cert_pem, &key_pem)?;
        server = server.with_tls(tls::acceptor(tls_config));
    }

    let address = server.start()?;
    info!(%address, "echo server running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    server.stop();
    Ok(())
}

async fn echo_client(
    executor: Executor,
    config: &WirelineConfig,
    connect: Option<SocketAddr>,
    message: &str,
    count: usize,
    interval: Duration,
) -> Result<()> {
    let mut client_config = ClientConfig::new(parse_addr(connect, &config.connect)?);
    client_config.no_delay = config.no_delay;
    client_config.session = session_settings(config);

    let mut client = Client::new(executor, client_config, Arc::new(|_| Box::new(Printer)));
    if config.tls.enabled {
        let ca_pem = std::fs::read_to_string(&config.tls.ca_file)
            .with_context(|| format!("reading {}", config.tls.ca_file))?;
        let tls_config = tls::make_client_config(Some(&ca_pem))?;
        client = client.with_tls(tls::connector(tls_config), tls::server_name("localhost")?);
    }

    client.connect().await?;
    let handshake_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !client.is_handshaked() {
        anyhow::ensure!(
            tokio::time::Instant::now() < handshake_deadline,
            "handshake did not complete"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for _ in 0..count {
        client.send(message.as_bytes());
        tokio::time::sleep(interval).await;
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    info!(
        bytes_out = client.bytes_sent(),
        bytes_in = client.bytes_received(),
        "done"
    );
    client.disconnect(false);
    Ok(())
}

async fn udp_echo(
    executor: Executor,
    config: &WirelineConfig,
    listen: Option<SocketAddr>,
) -> Result<()> {
    // The multicast option binds to the configured endpoint instead of an
    // ephemeral port, which is exactly what a fixed-port responder needs.
    let mut udp_config = UdpConfig::new(parse_addr(listen, &config.listen)?);
    udp_config.multicast = true;
    udp_config.reuse_address = true;
    udp_config.chunk_size = config.chunk_size;

    let endpoint = UdpEndpoint::new(
        executor,
        udp_config,
        Arc::new(|endpoint| {
            Box::new(UdpEcho {
                endpoint: Some(endpoint),
            })
        }),
    );
    endpoint.connect()?;

    info!(address = ?endpoint.local_addr(), "udp echo running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    endpoint.disconnect(false);
    Ok(())
}

async fn http_get(
    executor: Executor,
    config: &WirelineConfig,
    address: Option<SocketAddr>,
    target: &str,
    timeout: Duration,
    tls_sni: Option<String>,
) -> Result<()> {
    let client_config = ClientConfig::new(parse_addr(address, &config.connect)?);

    let mut client = HttpClientEx::new(executor, client_config);
    if let Some(sni) = tls_sni {
        let ca_pem = match config.tls.ca_file.is_empty() {
            true => None,
            false => Some(
                std::fs::read_to_string(&config.tls.ca_file)
                    .with_context(|| format!("reading {}", config.tls.ca_file))?,
            ),
        };
        let tls_config = tls::make_client_config(ca_pem.as_deref())?;
        client = client.with_tls(tls::connector(tls_config), tls::server_name(&sni)?);
    }

    let request = HttpRequest::make_get_request(target);
    let response = client.request(&request, timeout).await?;

    info!(
        status = response.status(),
        phrase = response.status_phrase(),
        "response received"
    );
    for (name, value) in response.headers() {
        info!("  {name}: {value}");
    }
    println!("{}", String::from_utf8_lossy(response.body()));

    client.client().disconnect(false);
    Ok(())
}
