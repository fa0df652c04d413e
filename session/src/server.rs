//! Accepting server with a session table and broadcast fan-out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use uuid::Uuid;
use wireline_executor::{Executor, Strand};

use crate::error::Error;
use crate::session::{Session, SessionHandlerFactory, SessionSettings, Transport};
use crate::transport::{apply_stream_options, bind_tcp_listener};

/// Server tuning and socket options.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on.
    pub address: SocketAddr,
    /// Disable Nagle coalescing on accepted sockets.
    pub no_delay: bool,
    /// Enable transport keepalive probes on accepted sockets.
    pub keep_alive: bool,
    /// Permit local address reuse for the listener.
    pub reuse_address: bool,
    /// Permit local port reuse for the listener (POSIX only).
    pub reuse_port: bool,
    /// Per-session buffer tuning.
    pub session: SessionSettings,
}

impl ServerConfig {
    /// Config listening on `address` with default options.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            no_delay: false,
            keep_alive: false,
            reuse_address: true,
            reuse_port: false,
            session: SessionSettings::default(),
        }
    }
}

/// State shared between the server handle and its sessions.
///
/// Sessions hold a `Weak` back-reference; the server outlives them. Table
/// mutations go through the server strand so registration, deregistration
/// and broadcast iteration never interleave.
pub(crate) struct ServerShared {
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    strand: Strand,
}

impl ServerShared {
    pub(crate) fn register(&self, session: Arc<Session>) {
        let sessions = self.sessions.clone();
        self.strand.dispatch(move || {
            sessions.insert(session.id(), session);
        });
    }

    pub(crate) fn unregister(&self, id: Uuid) {
        let sessions = self.sessions.clone();
        self.strand.dispatch(move || {
            sessions.remove(&id);
        });
    }

    pub(crate) fn add_bytes_sent(&self, amount: u64) {
        self.bytes_sent.fetch_add(amount, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, amount: u64) {
        self.bytes_received.fetch_add(amount, Ordering::Relaxed);
    }
}

/// TCP (or TLS, when an acceptor is attached) server.
///
/// Accepts connections, wraps each into a [`Session`] and keeps the live
/// sessions in a table keyed by session id. Sessions deregister themselves
/// as the final step of their shutdown.
pub struct Server {
    executor: Executor,
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    factory: SessionHandlerFactory,
    shared: Arc<ServerShared>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl Server {
    /// Create a server; `factory` builds the downcall handler for every
    /// accepted session.
    pub fn new(executor: Executor, config: ServerConfig, factory: SessionHandlerFactory) -> Self {
        let strand = executor.make_strand();
        Self {
            executor,
            config,
            tls: None,
            factory,
            shared: Arc::new(ServerShared {
                sessions: Arc::new(DashMap::new()),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                strand,
            }),
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            stop: Mutex::new(None),
        }
    }

    /// Terminate accepted connections with TLS using `acceptor`.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub fn start(&self) -> Result<SocketAddr, Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return self
                .local_addr()
                .ok_or(Error::NotConnected);
        }

        let listener = bind_tcp_listener(
            self.config.address,
            self.config.reuse_address,
            self.config.reuse_port,
        )?;
        let address = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(address);

        let (stop_tx, stop_rx) = watch::channel(true);
        *self.stop.lock().unwrap() = Some(stop_tx);

        info!(%address, tls = self.tls.is_some(), "server started");
        self.executor.spawn(accept_loop(
            listener,
            self.executor.clone(),
            self.shared.clone(),
            self.tls.clone(),
            self.factory.clone(),
            self.config.clone(),
            stop_rx,
        ));
        Ok(address)
    }

    /// Stop accepting and disconnect every live session.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(stop) = self.stop.lock().unwrap().take() {
            let _ = stop.send(false);
        }
        self.disconnect_all();
        info!("server stopped");
    }

    /// Whether the accept loop is running.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Queue `data` for transmission on every live session.
    ///
    /// Runs on the server strand so the iteration never interleaves with
    /// registration or deregistration.
    pub fn broadcast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        let sessions = self.shared.sessions.clone();
        let data = data.to_vec();
        self.shared.strand.dispatch(move || {
            for entry in sessions.iter() {
                entry.value().send(&data);
            }
        });
        true
    }

    /// Request disconnect on every live session.
    pub fn disconnect_all(&self) {
        let sessions = self.shared.sessions.clone();
        self.shared.strand.dispatch(move || {
            for entry in sessions.iter() {
                entry.value().disconnect(false);
            }
        });
    }

    /// Look a live session up by id.
    pub fn find_session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.shared.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of sessions currently registered.
    pub fn connected_sessions(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Bytes transmitted across all sessions since the server was created.
    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received across all sessions since the server was created.
    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }
}

async fn accept_loop(
    listener: TcpListener,
    executor: Executor,
    shared: Arc<ServerShared>,
    tls: Option<TlsAcceptor>,
    factory: SessionHandlerFactory,
    config: ServerConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if !*stop_rx.borrow() {
                    break;
                }
            }
            result = listener.accept() => match result {
                Ok((tcp, peer)) => {
                    if let Err(err) = apply_stream_options(&tcp, config.no_delay, config.keep_alive) {
                        warn!(%peer, error = %err, "failed to apply socket options");
                    }
                    let transport = match &tls {
                        Some(acceptor) => Transport::TlsAccept {
                            tcp,
                            acceptor: acceptor.clone(),
                        },
                        None => Transport::Plain(tcp),
                    };
                    Session::spawn(
                        &executor,
                        Uuid::new_v4(),
                        transport,
                        peer,
                        config.session,
                        Some(Arc::downgrade(&shared)),
                        &factory,
                    );
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientConfig};
    use crate::events::{ChannelEvents, SessionEvent, SessionEvents};
    use crate::transport::tls;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    struct Echo {
        session: Arc<Session>,
    }

    impl SessionEvents for Echo {
        fn on_received(&mut self, data: &[u8]) {
            self.session.send(data);
        }
    }

    fn echo_factory() -> SessionHandlerFactory {
        Arc::new(|session| Box::new(Echo { session }))
    }

    fn channel_factory() -> (SessionHandlerFactory, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = unbounded_channel();
        let factory: SessionHandlerFactory =
            Arc::new(move |session| Box::new(ChannelEvents::new(session.id(), tx.clone())));
        (factory, rx)
    }

    /// Accumulates received bytes and hands the session handle out so tests
    /// can inspect buffer growth and the server table.
    struct Accumulator {
        session: Arc<Session>,
        sessions: UnboundedSender<Arc<Session>>,
        received: Arc<StdMutex<Vec<u8>>>,
    }

    impl SessionEvents for Accumulator {
        fn on_connected(&mut self) {
            let _ = self.sessions.send(self.session.clone());
        }

        fn on_received(&mut self, data: &[u8]) {
            self.received.lock().unwrap().extend_from_slice(data);
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, what: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timeout waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn collect_until(
        rx: &mut UnboundedReceiver<SessionEvent>,
        mut done: impl FnMut(&[SessionEvent]) -> bool,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while !done(&events) {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event stream stalled")
                .expect("event channel closed");
            events.push(event);
        }
        events
    }

    fn received_total(events: &[SessionEvent]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for event in events {
            if let SessionEvent::Received { data, .. } = event {
                bytes.extend_from_slice(data);
            }
        }
        bytes
    }

    fn last_sent_index(events: &[SessionEvent]) -> Option<usize> {
        events
            .iter()
            .rposition(|e| matches!(e, SessionEvent::Sent { .. }))
    }

    fn empty_after_last_sent(events: &[SessionEvent]) -> bool {
        match last_sent_index(events) {
            Some(sent) => events[sent..]
                .iter()
                .any(|e| matches!(e, SessionEvent::Empty { .. })),
            None => false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn echo_preserves_send_ordering() {
        let executor = Executor::current();
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory(),
        );
        let address = server.start().unwrap();

        let (factory, mut rx) = channel_factory();
        let client = Client::new(executor, ClientConfig::new(address), factory);
        assert!(client.connect().await.unwrap());
        wait_until(|| client.is_handshaked(), "client handshake").await;

        assert!(client.send(b"A") > 0);
        client.send(b"BB");
        client.send(b"CCC");

        let events = collect_until(&mut rx, |events| {
            received_total(events).len() == 6 && empty_after_last_sent(events)
        })
        .await;

        assert_eq!(received_total(&events), b"ABBCCC");

        let sent_total: usize = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Sent { sent, .. } => Some(*sent),
                _ => None,
            })
            .sum();
        assert_eq!(sent_total, 6);

        let last_pending = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Sent { pending, .. } => Some(*pending),
                _ => None,
            })
            .last();
        assert_eq!(last_pending, Some(0));

        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::Connected { .. }))
                .count(),
            1
        );
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Handshaked { .. })));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn large_message_grows_receive_buffer() {
        let executor = Executor::current();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let (sessions_tx, mut sessions_rx) = unbounded_channel();

        let factory: SessionHandlerFactory = {
            let received = received.clone();
            Arc::new(move |session| {
                Box::new(Accumulator {
                    session,
                    sessions: sessions_tx.clone(),
                    received: received.clone(),
                })
            })
        };
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            factory,
        );
        let address = server.start().unwrap();

        let (client_factory, _rx) = channel_factory();
        let client = Client::new(executor, ClientConfig::new(address), client_factory);
        client.connect().await.unwrap();
        wait_until(|| client.is_handshaked(), "client handshake").await;

        let blob: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
        assert!(client.send(&blob) > 0);

        let server_session = timeout(Duration::from_secs(5), sessions_rx.recv())
            .await
            .expect("no accepted session")
            .unwrap();
        wait_until(
            || received.lock().unwrap().len() == blob.len(),
            "blob delivery",
        )
        .await;

        assert_eq!(*received.lock().unwrap(), blob);
        assert!(server_session.recv_buffer_capacity() >= 16384);
        assert_eq!(server_session.bytes_received(), blob.len() as u64);
        assert_eq!(server.bytes_received(), blob.len() as u64);
        assert_eq!(
            server.find_session(server_session.id()).map(|s| s.id()),
            Some(server_session.id())
        );

        server.stop();
    }

    /// Forwards events like [`ChannelEvents`] and requests a disconnect as
    /// soon as the first write completes.
    struct DisconnectOnFirstSent {
        inner: ChannelEvents,
        session: Arc<Session>,
        triggered: bool,
    }

    impl SessionEvents for DisconnectOnFirstSent {
        fn on_connected(&mut self) {
            self.inner.on_connected();
        }
        fn on_received(&mut self, data: &[u8]) {
            self.inner.on_received(data);
        }
        fn on_sent(&mut self, sent: usize, pending: usize) {
            self.inner.on_sent(sent, pending);
            if !self.triggered {
                self.triggered = true;
                self.session.disconnect(false);
            }
        }
        fn on_empty(&mut self) {
            self.inner.on_empty();
        }
        fn on_disconnected(&mut self) {
            self.inner.on_disconnected();
        }
        fn on_error(&mut self, error: &Error) {
            self.inner.on_error(error);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disconnect_during_active_send() {
        let executor = Executor::current();
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory(),
        );
        let address = server.start().unwrap();

        let (tx, mut rx) = unbounded_channel();
        let factory: SessionHandlerFactory = Arc::new(move |session| {
            Box::new(DisconnectOnFirstSent {
                inner: ChannelEvents::new(session.id(), tx.clone()),
                session,
                triggered: false,
            })
        });
        let client = Client::new(executor, ClientConfig::new(address), factory);
        client.connect().await.unwrap();
        wait_until(|| client.is_handshaked(), "client handshake").await;
        let session = client.session().unwrap();

        let blob = vec![0x5au8; 1024 * 1024];
        assert!(session.send(&blob) > 0);

        let events = collect_until(&mut rx, |events| {
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::Disconnected { .. }))
        })
        .await;

        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
                .count(),
            1
        );
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Disconnected { .. })
        ));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));

        let sent_total: u64 = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Sent { sent, .. } => Some(*sent as u64),
                _ => None,
            })
            .sum();
        assert_eq!(session.bytes_sent(), sent_total);
        assert!(sent_total <= blob.len() as u64);
        assert!(!session.is_connected());

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_senders_stay_contiguous() {
        let executor = Executor::current();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let (sessions_tx, _sessions_rx) = unbounded_channel();

        let factory: SessionHandlerFactory = {
            let received = received.clone();
            Arc::new(move |session| {
                Box::new(Accumulator {
                    session,
                    sessions: sessions_tx.clone(),
                    received: received.clone(),
                })
            })
        };
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            factory,
        );
        let address = server.start().unwrap();

        let (client_factory, _rx) = channel_factory();
        let client = Client::new(executor, ClientConfig::new(address), client_factory);
        client.connect().await.unwrap();
        wait_until(|| client.is_handshaked(), "client handshake").await;
        let session = client.session().unwrap();

        const BLOCK: usize = 256;
        const BLOCKS_PER_SENDER: usize = 25;
        let senders: Vec<_> = [b'a', b'b', b'c', b'd']
            .into_iter()
            .map(|tag| {
                let session = session.clone();
                std::thread::spawn(move || {
                    let block = vec![tag; BLOCK];
                    for _ in 0..BLOCKS_PER_SENDER {
                        while session.send(&block) == 0 {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let total = 4 * BLOCKS_PER_SENDER * BLOCK;
        wait_until(|| received.lock().unwrap().len() == total, "all blocks").await;

        let bytes = received.lock().unwrap();
        for chunk in bytes.chunks(BLOCK) {
            assert!(
                chunk.iter().all(|b| *b == chunk[0]),
                "interleaved write detected"
            );
        }

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn broadcast_reaches_every_session() {
        let executor = Executor::current();
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory(),
        );
        let address = server.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (factory, rx) = channel_factory();
            let client = Client::new(executor.clone(), ClientConfig::new(address), factory);
            client.connect().await.unwrap();
            clients.push((client, rx));
        }
        wait_until(|| server.connected_sessions() == 3, "session table fill").await;

        assert!(server.broadcast(b"hello"));
        for (_, rx) in &mut clients {
            let events =
                collect_until(rx, |events| received_total(events).len() >= 5).await;
            assert_eq!(received_total(&events), b"hello");
        }

        server.stop();
        wait_until(|| server.connected_sessions() == 0, "session table drain").await;
        for (client, rx) in &mut clients {
            let events = collect_until(rx, |events| {
                events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::Disconnected { .. }))
            })
            .await;
            assert!(matches!(
                events.last(),
                Some(SessionEvent::Disconnected { .. })
            ));
            assert!(!client.is_connected());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_reconnects_after_disconnect() {
        let executor = Executor::current();
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory(),
        );
        let address = server.start().unwrap();

        let (factory, mut rx) = channel_factory();
        let client = Client::new(executor, ClientConfig::new(address), factory);
        client.connect().await.unwrap();
        wait_until(|| client.is_handshaked(), "first handshake").await;

        assert!(client.reconnect().await.unwrap());
        wait_until(|| client.is_handshaked(), "second handshake").await;

        client.send(b"again");
        let events = collect_until(&mut rx, |events| {
            received_total(events).len() >= 5
                && events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::Disconnected { .. }))
        })
        .await;
        assert_eq!(received_total(&events), b"again");

        let connects = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Connected { .. }))
            .count();
        let disconnects = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
            .count();
        assert_eq!(connects, 2);
        assert_eq!(disconnects, 1);

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_without_connect_returns_zero() {
        let executor = Executor::current();
        let (factory, _rx) = channel_factory();
        let client = Client::new(
            executor,
            ClientConfig::new("127.0.0.1:1".parse().unwrap()),
            factory,
        );
        assert_eq!(client.send(b"data"), 0);
        assert!(!client.send_async(b"data"));
        assert!(!client.disconnect(true));
    }

    fn self_signed() -> (String, String) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        (certified.cert.pem(), certified.key_pair.serialize_pem())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tls_echo_end_to_end() {
        let executor = Executor::current();
        let (cert_pem, key_pem) = self_signed();

        let server_config = tls::make_server_config(&cert_pem, &key_pem).unwrap();
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory(),
        )
        .with_tls(tls::acceptor(server_config));
        let address = server.start().unwrap();

        let client_config = tls::make_client_config(Some(&cert_pem)).unwrap();
        let (factory, mut rx) = channel_factory();
        let client = Client::new(executor, ClientConfig::new(address), factory)
            .with_tls(tls::connector(client_config), tls::server_name("localhost").unwrap());
        client.connect().await.unwrap();
        wait_until(|| client.is_handshaked(), "tls handshake").await;

        client.send(b"secret");
        let events = collect_until(&mut rx, |events| received_total(events).len() >= 6).await;
        assert_eq!(received_total(&events), b"secret");

        let connected = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Connected { .. }))
            .unwrap();
        let handshaked = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Handshaked { .. }))
            .unwrap();
        let first_received = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Received { .. }))
            .unwrap();
        assert!(connected < handshaked);
        assert!(handshaked < first_received);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::Handshaked { .. }))
                .count(),
            1
        );
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));

        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tls_untrusted_certificate_fails_handshake() {
        let executor = Executor::current();
        let (cert_pem, key_pem) = self_signed();

        let server_config = tls::make_server_config(&cert_pem, &key_pem).unwrap();
        let server = Server::new(
            executor.clone(),
            ServerConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory(),
        )
        .with_tls(tls::acceptor(server_config));
        let address = server.start().unwrap();

        // Empty root store: the server certificate cannot verify.
        let client_config = tls::make_client_config(None).unwrap();
        let (factory, mut rx) = channel_factory();
        let client = Client::new(executor, ClientConfig::new(address), factory)
            .with_tls(tls::connector(client_config), tls::server_name("localhost").unwrap());
        client.connect().await.unwrap();

        let events = collect_until(&mut rx, |events| {
            events
                .iter()
                .any(|e| matches!(e, SessionEvent::Disconnected { .. }))
        })
        .await;

        let connected = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Connected { .. }))
            .unwrap();
        let error = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Error { .. }))
            .expect("handshake failure must surface");
        let disconnected = events
            .iter()
            .position(|e| matches!(e, SessionEvent::Disconnected { .. }))
            .unwrap();
        assert!(connected < error);
        assert!(error < disconnected);
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Handshaked { .. })));

        server.stop();
    }
}
