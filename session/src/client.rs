//! Connecting client for TCP and TLS endpoints.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;
use uuid::Uuid;
use wireline_executor::Executor;

use crate::error::Error;
use crate::session::{Session, SessionHandlerFactory, SessionSettings, Transport};
use crate::transport::connect_tcp;

/// Client tuning and socket options.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Address to connect to.
    pub address: SocketAddr,
    /// Disable Nagle coalescing.
    pub no_delay: bool,
    /// Enable transport keepalive probes.
    pub keep_alive: bool,
    /// Per-session buffer tuning.
    pub session: SessionSettings,
}

impl ClientConfig {
    /// Config connecting to `address` with default options.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            no_delay: false,
            keep_alive: false,
            session: SessionSettings::default(),
        }
    }
}

/// TCP (or TLS, when a connector is attached) client owning one session.
///
/// The client keeps a stable id across reconnects; each connect builds a
/// fresh session around it.
pub struct Client {
    id: Uuid,
    executor: Executor,
    config: ClientConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    factory: SessionHandlerFactory,
    session: Mutex<Option<Arc<Session>>>,
}

impl Client {
    /// Create a client; `factory` builds the downcall handler on every
    /// connect.
    pub fn new(executor: Executor, config: ClientConfig, factory: SessionHandlerFactory) -> Self {
        Self {
            id: Uuid::new_v4(),
            executor,
            config,
            tls: None,
            factory,
            session: Mutex::new(None),
        }
    }

    /// Wrap connections with TLS, verifying the peer as `server_name`.
    pub fn with_tls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    /// Client (and session) id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The current session, if a connect has happened.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    /// Whether the current session is connected.
    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| s.is_connected())
    }

    /// Whether the current session may carry application data.
    pub fn is_handshaked(&self) -> bool {
        self.session().is_some_and(|s| s.is_handshaked())
    }

    /// Dial the configured address and spawn a session around the socket.
    ///
    /// Returns `Ok(false)` when already connected. TLS handshake progress
    /// and failures are reported through the session downcalls.
    pub async fn connect(&self) -> Result<bool, Error> {
        if self.is_connected() {
            return Ok(false);
        }

        let tcp = connect_tcp(self.config.address, self.config.no_delay, self.config.keep_alive)
            .await?;
        let peer = tcp.peer_addr()?;
        let transport = match &self.tls {
            Some((connector, server_name)) => Transport::TlsConnect {
                tcp,
                connector: connector.clone(),
                server_name: server_name.clone(),
            },
            None => Transport::Plain(tcp),
        };

        let session = Session::spawn(
            &self.executor,
            self.id,
            transport,
            peer,
            self.config.session,
            None,
            &self.factory,
        );
        debug!(client = %self.id, %peer, "client connected");
        *self.session.lock().unwrap() = Some(session);
        Ok(true)
    }

    /// Request a graceful shutdown of the current session.
    pub fn disconnect(&self, dispatch: bool) -> bool {
        self.session().is_some_and(|s| s.disconnect(dispatch))
    }

    /// Disconnect, await the shutdown completing, and dial again.
    pub async fn reconnect(&self) -> Result<bool, Error> {
        if let Some(session) = self.session() {
            let mut watch = session.connected_watch();
            session.disconnect(false);
            // Sequenced on the session's own state transition; no spinning.
            let _ = watch.wait_for(|connected| !connected).await;
        }
        self.connect().await
    }

    /// Queue bytes on the current session. See [`Session::send`].
    pub fn send(&self, buffer: &[u8]) -> usize {
        self.session().map_or(0, |s| s.send(buffer))
    }

    /// Queue bytes, bounded by the send-buffer limit. See
    /// [`Session::send_async`].
    pub fn send_async(&self, buffer: &[u8]) -> bool {
        self.session().is_some_and(|s| s.send_async(buffer))
    }

    /// Bytes transmitted on the current session.
    pub fn bytes_sent(&self) -> u64 {
        self.session().map_or(0, |s| s.bytes_sent())
    }

    /// Bytes received on the current session.
    pub fn bytes_received(&self) -> u64 {
        self.session().map_or(0, |s| s.bytes_received())
    }
}
