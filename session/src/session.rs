//! Per-connection session engine for TCP and TLS transports.
//!
//! Each session owns its socket and is driven by a single task (its
//! serializer): every I/O completion and every lifecycle downcall runs
//! there, so user handlers never observe concurrent calls. Application
//! threads interact only with the shared [`Session`] handle, whose `send`
//! appends to the producer half of a double buffer and wakes the driver.
//!
//! The double buffer is the core concurrency trick: producers append to
//! `send_main` under a short-held lock; the driver swaps it with the empty
//! flush buffer and transmits the flush buffer without any lock, because it
//! is the sole mutator while a write is outstanding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use wireline_executor::Executor;

use crate::error::Error;
use crate::events::SessionEvents;
use crate::server::ServerShared;
use crate::transport::IoStream;

/// Initial receive-buffer capacity hint, in bytes.
pub const CHUNK: usize = 8192;

/// Per-session tuning knobs shared by servers and clients.
#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    /// Initial receive-buffer size is `chunk_size + 1`; the buffer doubles
    /// whenever a read fills it exactly and never shrinks.
    pub chunk_size: usize,
    /// Upper bound on queued-but-unsent bytes accepted by
    /// [`Session::send_async`]. Zero means unlimited.
    pub send_buffer_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK,
            send_buffer_limit: 0,
        }
    }
}

/// Point-in-time statistics snapshot for a session.
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Total bytes received this connect.
    pub bytes_received: u64,
    /// Total bytes sent this connect.
    pub bytes_sent: u64,
    /// Bytes queued in the producer buffer, not yet handed to the kernel.
    pub send_pending: usize,
    /// Current receive-buffer capacity.
    pub recv_buffer_capacity: usize,
}

/// Builds the downcall handler for a freshly created session.
pub type SessionHandlerFactory =
    Arc<dyn Fn(Arc<Session>) -> Box<dyn SessionEvents> + Send + Sync>;

pub(crate) enum SessionCommand {
    TrySend,
    Disconnect,
}

/// The transport a session drives, captured before its handshake.
pub(crate) enum Transport {
    Plain(TcpStream),
    TlsAccept {
        tcp: TcpStream,
        acceptor: TlsAcceptor,
    },
    TlsConnect {
        tcp: TcpStream,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl Transport {
    fn is_tls(&self) -> bool {
        !matches!(self, Transport::Plain(_))
    }

    async fn handshake(self) -> std::io::Result<IoStream> {
        match self {
            Transport::Plain(tcp) => Ok(IoStream::Plain(tcp)),
            Transport::TlsAccept { tcp, acceptor } => {
                Ok(IoStream::Tls(Box::new(acceptor.accept(tcp).await?)))
            }
            Transport::TlsConnect {
                tcp,
                connector,
                server_name,
            } => Ok(IoStream::TlsClient(Box::new(
                connector.connect(server_name, tcp).await?,
            ))),
        }
    }
}

/// Shared handle to a live (or finished) transport session.
///
/// Cheap to clone through `Arc`; safe to use from any thread. All state
/// other than the producer send buffer is owned by the session's driver.
pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    connected: AtomicBool,
    handshaked: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    recv_capacity: AtomicUsize,
    send_buffer_limit: usize,
    send_main: Mutex<Vec<u8>>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Sender<bool>,
    server: Option<Weak<ServerShared>>,
}

impl Session {
    /// Stable unique identifier assigned at construction.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Peer address of the underlying socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether the socket is open and registered.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether application data may flow. Plain TCP sessions become
    /// handshaked together with connected.
    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::SeqCst)
    }

    /// Total bytes successfully transmitted this connect.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Total bytes successfully received this connect.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Current receive-buffer capacity. Starts at `chunk_size + 1` and only
    /// grows.
    pub fn recv_buffer_capacity(&self) -> usize {
        self.recv_capacity.load(Ordering::Relaxed)
    }

    /// Bytes currently queued in the producer buffer.
    pub fn send_pending(&self) -> usize {
        self.send_main.lock().unwrap().len()
    }

    /// Observe connected-state transitions, e.g. to await a disconnect.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Point-in-time statistics snapshot.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_received: self.bytes_received(),
            bytes_sent: self.bytes_sent(),
            send_pending: self.send_pending(),
            recv_buffer_capacity: self.recv_buffer_capacity(),
        }
    }

    /// Queue bytes for transmission and wake the transmitter.
    ///
    /// May be called from any thread and never blocks on I/O. Returns the
    /// size of the producer buffer after the append (a back-pressure
    /// signal), or 0 when the session is not handshaked or `buffer` is
    /// empty.
    pub fn send(&self, buffer: &[u8]) -> usize {
        if buffer.is_empty() || !self.is_handshaked() {
            return 0;
        }
        let pending = {
            let mut main = self.send_main.lock().unwrap();
            main.extend_from_slice(buffer);
            main.len()
        };
        let _ = self.cmd_tx.send(SessionCommand::TrySend);
        pending
    }

    /// Queue bytes for transmission, refusing to grow the producer buffer
    /// past the configured limit. Returns whether the bytes were accepted.
    pub fn send_async(&self, buffer: &[u8]) -> bool {
        if buffer.is_empty() || !self.is_handshaked() {
            return false;
        }
        {
            let mut main = self.send_main.lock().unwrap();
            if self.send_buffer_limit > 0 && main.len() + buffer.len() > self.send_buffer_limit {
                return false;
            }
            main.extend_from_slice(buffer);
        }
        let _ = self.cmd_tx.send(SessionCommand::TrySend);
        true
    }

    /// Request a graceful shutdown. Returns `false` when the session is not
    /// connected.
    ///
    /// Both flavors defer to the completion currently being processed;
    /// `dispatch` is accepted for call sites that would run the request
    /// inline when already on the serializer. Either way the TLS shutdown
    /// (when applicable) and socket close run on the serializer,
    /// `on_disconnected` fires exactly once, and the session leaves its
    /// server's table.
    pub fn disconnect(&self, dispatch: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let _ = dispatch;
        self.cmd_tx.send(SessionCommand::Disconnect).is_ok()
    }

    fn server_shared(&self) -> Option<Arc<ServerShared>> {
        self.server.as_ref().and_then(Weak::upgrade)
    }

    /// Create a session around `transport` and spawn its driver.
    pub(crate) fn spawn(
        executor: &Executor,
        id: Uuid,
        transport: Transport,
        peer: SocketAddr,
        settings: SessionSettings,
        server: Option<Weak<ServerShared>>,
        factory: &SessionHandlerFactory,
    ) -> Arc<Session> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        // The socket is already open by the time a session wraps it.
        let (state, _) = watch::channel(true);
        let core = Arc::new(Session {
            id,
            peer,
            connected: AtomicBool::new(true),
            handshaked: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            recv_capacity: AtomicUsize::new(settings.chunk_size + 1),
            send_buffer_limit: settings.send_buffer_limit,
            send_main: Mutex::new(Vec::new()),
            cmd_tx,
            state,
            server,
        });

        let handler = factory(core.clone());
        let driver = SessionDriver {
            core: core.clone(),
            transport: Some(transport),
            handler,
            cmd_rx,
            recv_buffer: vec![0; settings.chunk_size + 1],
            send_flush: Vec::new(),
            flush_offset: 0,
        };
        executor.spawn(driver.run());
        core
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("handshaked", &self.is_handshaked())
            .finish()
    }
}

/// Owns the socket and serializes all completions and downcalls.
struct SessionDriver {
    core: Arc<Session>,
    transport: Option<Transport>,
    handler: Box<dyn SessionEvents>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    recv_buffer: Vec<u8>,
    send_flush: Vec<u8>,
    flush_offset: usize,
}

impl SessionDriver {
    async fn run(mut self) {
        let core = self.core.clone();
        trace!(session = %core.id, peer = %core.peer, "session connecting");

        // Connecting → Connected: reset statistics, register, notify.
        core.bytes_sent.store(0, Ordering::Relaxed);
        core.bytes_received.store(0, Ordering::Relaxed);
        if let Some(server) = core.server_shared() {
            server.register(core.clone());
        }
        self.handler.on_connected();

        let transport = self.transport.take().expect("session driver runs once");
        let is_tls = transport.is_tls();
        let stream = match transport.handshake().await {
            Ok(stream) => stream,
            Err(err) => {
                self.report_error(err);
                self.finish(None).await;
                return;
            }
        };

        // Handshaking → Handshaked (plain TCP collapses into Connected).
        core.handshaked.store(true, Ordering::SeqCst);
        if is_tls {
            self.handler.on_handshaked();
        }
        self.handler.on_empty();

        let (reader, writer) = tokio::io::split(stream);
        let writer = self.io_loop(reader, writer).await;
        self.finish(Some(writer)).await;
    }

    /// Receive and transmit until EOF, error, or a disconnect request.
    ///
    /// At most one read and one write are outstanding at any instant: both
    /// are futures owned by this loop. Returns the write half so shutdown
    /// can flush the TLS close_notify before the socket closes.
    async fn io_loop(
        &mut self,
        mut reader: ReadHalf<IoStream>,
        mut writer: WriteHalf<IoStream>,
    ) -> WriteHalf<IoStream> {
        let mut check_send = false;

        loop {
            // TrySend entry: swap the flush and producer buffers while no
            // write is outstanding, and report the drained state once.
            if check_send && self.send_flush.is_empty() {
                {
                    let mut main = self.core.send_main.lock().unwrap();
                    std::mem::swap(&mut self.send_flush, &mut *main);
                }
                self.flush_offset = 0;
                if self.send_flush.is_empty() {
                    check_send = false;
                    self.handler.on_empty();
                }
            }

            // Unbiased: reads, writes and control commands share the loop
            // fairly, so a saturated direction cannot starve the other.
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::TrySend) => check_send = true,
                    Some(SessionCommand::Disconnect) | None => return writer,
                },

                result = writer.write(&self.send_flush[self.flush_offset..]),
                    if !self.send_flush.is_empty() =>
                {
                    match result {
                        Ok(0) => return writer,
                        Ok(sent) => {
                            self.core.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                            if let Some(server) = self.core.server_shared() {
                                server.add_bytes_sent(sent as u64);
                            }
                            self.flush_offset += sent;
                            if self.flush_offset == self.send_flush.len() {
                                self.send_flush.clear();
                                self.flush_offset = 0;
                            }
                            let pending = self.send_flush.len() - self.flush_offset;
                            self.handler.on_sent(sent, pending);
                            check_send = true;
                        }
                        Err(err) => {
                            self.report_error(err);
                            return writer;
                        }
                    }
                },

                result = reader.read(&mut self.recv_buffer) => {
                    match result {
                        // Clean peer close: shut down silently.
                        Ok(0) => return writer,
                        Ok(received) => {
                            self.core
                                .bytes_received
                                .fetch_add(received as u64, Ordering::Relaxed);
                            if let Some(server) = self.core.server_shared() {
                                server.add_bytes_received(received as u64);
                            }
                            // A full read means the peer likely had more
                            // queued; double the buffer for the next one.
                            if received == self.recv_buffer.len() {
                                self.recv_buffer.resize(2 * received, 0);
                                self.core
                                    .recv_capacity
                                    .store(self.recv_buffer.len(), Ordering::Relaxed);
                            }
                            self.handler.on_received(&self.recv_buffer[..received]);
                        }
                        Err(err) => {
                            self.report_error(err);
                            return writer;
                        }
                    }
                },
            }
        }
    }

    /// ShuttingDown → Closed: TLS shutdown, socket close, buffer clear,
    /// final downcall, deregistration.
    async fn finish(&mut self, writer: Option<WriteHalf<IoStream>>) {
        let core = &self.core;

        if let Some(mut writer) = writer {
            // Sends the TLS close_notify (a FIN for plain TCP) before the
            // socket handle drops.
            let _ = writer.shutdown().await;
        }

        {
            let mut main = core.send_main.lock().unwrap();
            main.clear();
        }
        self.send_flush.clear();
        self.flush_offset = 0;

        core.handshaked.store(false, Ordering::SeqCst);
        core.connected.store(false, Ordering::SeqCst);
        let _ = core.state.send(false);

        self.handler.on_disconnected();

        if let Some(server) = core.server_shared() {
            server.unregister(core.id);
        }
        debug!(session = %core.id, peer = %core.peer, "session closed");
    }

    fn report_error(&mut self, err: std::io::Error) {
        let err = Error::from(err);
        if err.is_suppressed() {
            debug!(session = %self.core.id, error = %err, "suppressed transport error");
            return;
        }
        warn!(session = %self.core.id, error = %err, "session error");
        self.handler.on_error(&err);
    }
}
