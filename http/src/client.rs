//! HTTP and HTTPS clients over wireline transport sessions.
//!
//! [`HttpClient`] wraps a TCP (or TLS) session client: outbound requests
//! are written from their serialized byte cache, inbound bytes feed the
//! incremental response parser, and completed headers/responses surface
//! through the [`HttpEvents`] downcalls. [`HttpClientEx`] additionally ties
//! a single in-flight request to an awaitable result with a deadline.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tracing::debug;
use wireline_executor::Executor;
use wireline_session::{
    Client, ClientConfig, Error, Session, SessionEvents, SessionHandlerFactory,
};

use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Downcalls for HTTP response progress.
#[allow(unused_variables)]
pub trait HttpEvents: Send + 'static {
    /// The response header finished parsing.
    fn on_received_response_header(&mut self, response: &HttpResponse) {}
    /// A whole response finished parsing.
    fn on_received_response(&mut self, response: &HttpResponse) {}
    /// The response bytes could not be parsed; the session disconnects.
    fn on_received_response_error(&mut self, response: &HttpResponse, error: &str) {}
    /// The underlying session disconnected.
    fn on_disconnected(&mut self) {}
}

/// Builds the response downcall handler on every connect.
pub type HttpEventsFactory = Arc<dyn Fn() -> Box<dyn HttpEvents> + Send + Sync>;

type PendingRequest = Arc<Mutex<Option<Vec<u8>>>>;

/// Session handler bridging raw received bytes into parsed responses.
struct ResponsePump {
    session: Arc<Session>,
    response: HttpResponse,
    pending: PendingRequest,
    events: Box<dyn HttpEvents>,
}

impl ResponsePump {
    fn flush_pending(&mut self) {
        if let Some(bytes) = self.pending.lock().unwrap().take() {
            self.session.send(&bytes);
        }
    }
}

impl SessionEvents for ResponsePump {
    fn on_handshaked(&mut self) {
        self.flush_pending();
    }

    fn on_empty(&mut self) {
        // Plain TCP sessions have no handshake downcall; the first empty
        // notification is the earliest moment application data may flow.
        self.flush_pending();
    }

    fn on_received(&mut self, data: &[u8]) {
        match self.response.advance(data) {
            Ok(progress) => {
                if progress.header_complete {
                    self.events.on_received_response_header(&self.response);
                }
                if progress.complete {
                    self.events.on_received_response(&self.response);
                    self.response.clear();
                }
            }
            Err(err) => {
                self.events
                    .on_received_response_error(&self.response, &err.to_string());
                self.response.clear();
                self.session.disconnect(false);
            }
        }
    }

    fn on_disconnected(&mut self) {
        if self.response.finish_on_close() {
            self.events.on_received_response(&self.response);
        }
        self.events.on_disconnected();
    }
}

/// HTTP client over a TCP (or, with [`HttpClient::with_tls`], TLS) session.
pub struct HttpClient {
    inner: Client,
    address: SocketAddr,
    pending: PendingRequest,
}

impl HttpClient {
    /// Create a client; `events` builds the response handler per connect.
    pub fn new(executor: Executor, config: ClientConfig, events: HttpEventsFactory) -> Self {
        let address = config.address;
        let pending: PendingRequest = Arc::new(Mutex::new(None));
        let factory: SessionHandlerFactory = {
            let pending = pending.clone();
            Arc::new(move |session| {
                Box::new(ResponsePump {
                    session,
                    response: HttpResponse::new(),
                    pending: pending.clone(),
                    events: events(),
                })
            })
        };
        Self {
            inner: Client::new(executor, config, factory),
            address,
            pending,
        }
    }

    /// Speak HTTPS: wrap connections with TLS, verifying the peer as
    /// `server_name`.
    pub fn with_tls(self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        let Self {
            inner,
            address,
            pending,
        } = self;
        Self {
            inner: inner.with_tls(connector, server_name),
            address,
            pending,
        }
    }

    /// Dial the configured server.
    pub async fn connect(&self) -> Result<bool, Error> {
        self.inner.connect().await
    }

    /// Request a graceful shutdown of the current session.
    pub fn disconnect(&self, dispatch: bool) -> bool {
        self.inner.disconnect(dispatch)
    }

    /// Disconnect, await completion, and dial again.
    pub async fn reconnect(&self) -> Result<bool, Error> {
        self.inner.reconnect().await
    }

    /// Whether the current session is connected.
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Whether the current session may carry application data.
    pub fn is_handshaked(&self) -> bool {
        self.inner.is_handshaked()
    }

    /// The current session, if a connect has happened.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.session()
    }

    /// Write the request's serialized bytes. Returns the queued size, 0
    /// when the session cannot carry data yet.
    pub fn send_request(&self, request: &HttpRequest) -> usize {
        self.inner.send(&self.request_bytes(request))
    }

    /// Queue the request's serialized bytes, bounded by the send-buffer
    /// limit.
    pub fn send_request_async(&self, request: &HttpRequest) -> bool {
        self.inner.send_async(&self.request_bytes(request))
    }

    /// Stash a request to be written the moment the session can carry
    /// data, sending immediately when it already can.
    pub(crate) fn queue_request(&self, request: &HttpRequest) {
        let bytes = self.request_bytes(request);
        *self.pending.lock().unwrap() = Some(bytes);
        if self.is_handshaked() {
            if let Some(bytes) = self.pending.lock().unwrap().take() {
                self.inner.send(&bytes);
            }
        }
    }

    fn request_bytes(&self, request: &HttpRequest) -> Vec<u8> {
        if request.header("host").is_some() {
            request.to_bytes()
        } else {
            request
                .clone()
                .with_header("Host", &self.address.to_string())
                .to_bytes()
        }
    }
}

type ResponseSlot = Arc<Mutex<Option<oneshot::Sender<Result<HttpResponse, Error>>>>>;

/// Resolves the extended client's in-flight request slot.
struct SlotEvents {
    slot: ResponseSlot,
}

impl SlotEvents {
    fn resolve(&self, result: Result<HttpResponse, Error>) {
        if let Some(tx) = self.slot.lock().unwrap().take() {
            let _ = tx.send(result);
        }
    }
}

impl HttpEvents for SlotEvents {
    fn on_received_response(&mut self, response: &HttpResponse) {
        self.resolve(Ok(response.clone()));
    }

    fn on_received_response_error(&mut self, _response: &HttpResponse, error: &str) {
        self.resolve(Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            error.to_string(),
        ))));
    }

    fn on_disconnected(&mut self) {
        self.resolve(Err(Error::NotConnected));
    }
}

/// HTTP client whose requests resolve an awaitable result under a deadline.
///
/// One request may be in flight at a time. The deadline expiring or the
/// session disconnecting resolves the request with an error; expiry also
/// tears the connection down.
pub struct HttpClientEx {
    client: HttpClient,
    slot: ResponseSlot,
}

impl HttpClientEx {
    /// Create an extended client for `config`.
    pub fn new(executor: Executor, config: ClientConfig) -> Self {
        let slot: ResponseSlot = Arc::new(Mutex::new(None));
        let events: HttpEventsFactory = {
            let slot = slot.clone();
            Arc::new(move || Box::new(SlotEvents { slot: slot.clone() }))
        };
        Self {
            client: HttpClient::new(executor, config, events),
            slot,
        }
    }

    /// Speak HTTPS.
    pub fn with_tls(self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        let Self { client, slot } = self;
        Self {
            client: client.with_tls(connector, server_name),
            slot,
        }
    }

    /// The wrapped client.
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Issue `request`, connecting first when needed, and await the
    /// response for at most `deadline`.
    pub async fn request(
        &self,
        request: &HttpRequest,
        deadline: Duration,
    ) -> Result<HttpResponse, Error> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().unwrap() = Some(tx);

        self.client.queue_request(request);
        if !self.client.is_connected() {
            self.client.connect().await?;
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                debug!(%request, "request deadline elapsed, disconnecting");
                self.slot.lock().unwrap().take();
                self.client.disconnect(false);
                Err(Error::Timeout)
            }
        }
    }
}
