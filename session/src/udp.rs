//! UDP endpoint with multicast support.
//!
//! Differs from the stream sessions in four ways: there is no handshake,
//! sends are synchronous bounded datagrams with an explicit destination,
//! multicast join/leave are routed to the serializer, and receives report
//! the sender endpoint. The adaptive receive-buffer rule is shared.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use wireline_executor::Executor;

use crate::error::Error;
use crate::events::UdpEvents;
use crate::session::CHUNK;
use crate::transport::bind_udp_socket;

/// UDP endpoint tuning and socket options.
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Default destination endpoint; with `multicast` set this is also the
    /// bind address.
    pub address: SocketAddr,
    /// Permit local address reuse.
    pub reuse_address: bool,
    /// Permit local port reuse (POSIX only).
    pub reuse_port: bool,
    /// Bind to `address` itself (multicast receiver) instead of an
    /// ephemeral port.
    pub multicast: bool,
    /// Initial receive-buffer size is `chunk_size + 1`.
    pub chunk_size: usize,
}

impl UdpConfig {
    /// Config targeting `address` with default options.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            reuse_address: false,
            reuse_port: false,
            multicast: false,
            chunk_size: CHUNK,
        }
    }
}

/// Builds the downcall handler for a UDP endpoint connect.
pub type UdpHandlerFactory =
    Arc<dyn Fn(Arc<UdpEndpoint>) -> Box<dyn UdpEvents> + Send + Sync>;

enum UdpCommand {
    JoinMulticastGroup(IpAddr),
    LeaveMulticastGroup(IpAddr),
    Sent { to: SocketAddr, sent: usize },
    Fatal(std::io::Error),
    Disconnect,
}

/// Datagram endpoint. Reusable across connect/disconnect cycles.
pub struct UdpEndpoint {
    id: Uuid,
    executor: Executor,
    config: UdpConfig,
    factory: UdpHandlerFactory,
    connected: AtomicBool,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    recv_capacity: AtomicUsize,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<UdpCommand>>>,
    state: watch::Sender<bool>,
}

impl UdpEndpoint {
    /// Create an endpoint; `factory` builds the downcall handler on every
    /// connect.
    pub fn new(executor: Executor, config: UdpConfig, factory: UdpHandlerFactory) -> Arc<Self> {
        let chunk = config.chunk_size;
        let (state, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            executor,
            config,
            factory,
            connected: AtomicBool::new(false),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            recv_capacity: AtomicUsize::new(chunk + 1),
            socket: Mutex::new(None),
            cmd_tx: Mutex::new(None),
            state,
        })
    }

    /// Endpoint id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the socket is bound and receiving.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Address the socket is bound to, while connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.lock().unwrap();
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Datagrams transmitted this connect.
    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    /// Datagrams received this connect.
    pub fn datagrams_received(&self) -> u64 {
        self.datagrams_received.load(Ordering::Relaxed)
    }

    /// Bytes transmitted this connect.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received this connect.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Current receive-buffer capacity.
    pub fn recv_buffer_capacity(&self) -> usize {
        self.recv_capacity.load(Ordering::Relaxed)
    }

    /// Observe connected-state transitions.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Bind the socket and start the receive loop.
    ///
    /// With the `multicast` option the socket binds to the configured
    /// endpoint itself; otherwise to an ephemeral port of the same address
    /// family. Returns `Ok(false)` when already connected.
    pub fn connect(self: &Arc<Self>) -> Result<bool, Error> {
        if self.is_connected() {
            return Ok(false);
        }

        let bind_addr = if self.config.multicast {
            self.config.address
        } else {
            let ip: IpAddr = match self.config.address {
                SocketAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            };
            SocketAddr::new(ip, 0)
        };
        let socket = Arc::new(bind_udp_socket(
            bind_addr,
            self.config.reuse_address,
            self.config.reuse_port,
        )?);

        self.datagrams_sent.store(0, Ordering::Relaxed);
        self.datagrams_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        *self.socket.lock().unwrap() = Some(socket.clone());
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state.send(true);

        let driver = UdpDriver {
            endpoint: self.clone(),
            socket,
            handler: (self.factory)(self.clone()),
            cmd_rx,
            recv_buffer: vec![0; self.config.chunk_size + 1],
        };
        self.executor.spawn(driver.run());
        Ok(true)
    }

    /// Close the socket and stop receiving. Returns `false` when not
    /// connected.
    pub fn disconnect(&self, dispatch: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        let _ = dispatch;
        self.command(UdpCommand::Disconnect)
    }

    /// Disconnect, await the shutdown completing, and bind again.
    pub async fn reconnect(self: &Arc<Self>) -> Result<bool, Error> {
        if self.is_connected() {
            let mut watch = self.state.subscribe();
            self.disconnect(false);
            let _ = watch.wait_for(|connected| !connected).await;
        }
        self.connect()
    }

    /// Join a multicast group. The join runs on the serializer and is
    /// confirmed through `on_joined_multicast_group`.
    pub fn join_multicast_group(&self, address: IpAddr) -> bool {
        self.is_connected() && self.command(UdpCommand::JoinMulticastGroup(address))
    }

    /// Leave a multicast group.
    pub fn leave_multicast_group(&self, address: IpAddr) -> bool {
        self.is_connected() && self.command(UdpCommand::LeaveMulticastGroup(address))
    }

    /// Send a datagram to the configured default endpoint.
    pub fn send(&self, buffer: &[u8]) -> bool {
        self.send_to(self.config.address, buffer)
    }

    /// Send a datagram to `endpoint` without suspending the caller.
    ///
    /// Datagrams are bounded, so the write either completes immediately or
    /// is dropped (`false`). Fatal socket errors tear the endpoint down.
    pub fn send_to(&self, endpoint: SocketAddr, buffer: &[u8]) -> bool {
        if buffer.is_empty() || !self.is_connected() {
            return false;
        }
        let socket = match self.socket.lock().unwrap().as_ref() {
            Some(socket) => socket.clone(),
            None => return false,
        };

        match socket.try_send_to(buffer, endpoint) {
            Ok(sent) => {
                self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.command(UdpCommand::Sent { to: endpoint, sent });
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                trace!(endpoint = %self.id, "send buffer full, datagram dropped");
                false
            }
            Err(err) => {
                self.command(UdpCommand::Fatal(err));
                false
            }
        }
    }

    fn command(&self, command: UdpCommand) -> bool {
        let cmd_tx = self.cmd_tx.lock().unwrap();
        match cmd_tx.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("id", &self.id)
            .field("address", &self.config.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Owns the receive loop and serializes all downcalls.
struct UdpDriver {
    endpoint: Arc<UdpEndpoint>,
    socket: Arc<UdpSocket>,
    handler: Box<dyn UdpEvents>,
    cmd_rx: mpsc::UnboundedReceiver<UdpCommand>,
    recv_buffer: Vec<u8>,
}

impl UdpDriver {
    async fn run(mut self) {
        self.handler.on_connected();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(UdpCommand::JoinMulticastGroup(address)) => {
                        match self.join(address) {
                            Ok(()) => self.handler.on_joined_multicast_group(&address.to_string()),
                            Err(err) => self.report_error(err),
                        }
                    }
                    Some(UdpCommand::LeaveMulticastGroup(address)) => {
                        match self.leave(address) {
                            Ok(()) => self.handler.on_left_multicast_group(&address.to_string()),
                            Err(err) => self.report_error(err),
                        }
                    }
                    Some(UdpCommand::Sent { to, sent }) => {
                        self.handler.on_sent(to, sent);
                    }
                    Some(UdpCommand::Fatal(err)) => {
                        self.report_error(err);
                        break;
                    }
                    Some(UdpCommand::Disconnect) | None => break,
                },

                result = self.socket.recv_from(&mut self.recv_buffer) => match result {
                    Ok((received, from)) => {
                        self.endpoint
                            .datagrams_received
                            .fetch_add(1, Ordering::Relaxed);
                        self.endpoint
                            .bytes_received
                            .fetch_add(received as u64, Ordering::Relaxed);
                        if received == self.recv_buffer.len() {
                            self.recv_buffer.resize(2 * received, 0);
                            self.endpoint
                                .recv_capacity
                                .store(self.recv_buffer.len(), Ordering::Relaxed);
                        }
                        self.handler.on_received(from, &self.recv_buffer[..received]);
                    }
                    Err(err) => {
                        self.report_error(err);
                        break;
                    }
                },
            }
        }

        self.finish();
    }

    fn join(&self, address: IpAddr) -> std::io::Result<()> {
        match address {
            IpAddr::V4(group) => self
                .socket
                .join_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(group) => self.socket.join_multicast_v6(&group, 0),
        }
    }

    fn leave(&self, address: IpAddr) -> std::io::Result<()> {
        match address {
            IpAddr::V4(group) => self
                .socket
                .leave_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(group) => self.socket.leave_multicast_v6(&group, 0),
        }
    }

    fn finish(&mut self) {
        let endpoint = &self.endpoint;
        *endpoint.socket.lock().unwrap() = None;
        *endpoint.cmd_tx.lock().unwrap() = None;
        endpoint.connected.store(false, Ordering::SeqCst);
        let _ = endpoint.state.send(false);
        self.handler.on_disconnected();
        debug!(endpoint = %endpoint.id, "udp endpoint closed");
    }

    fn report_error(&mut self, err: std::io::Error) {
        let err = Error::from(err);
        if err.is_suppressed() {
            debug!(endpoint = %self.endpoint.id, error = %err, "suppressed socket error");
            return;
        }
        warn!(endpoint = %self.endpoint.id, error = %err, "udp endpoint error");
        self.handler.on_error(&err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use tokio::time::timeout;

    #[derive(Debug)]
    enum Seen {
        Received { from: SocketAddr, data: Vec<u8> },
        Joined(String),
        Left(String),
    }

    struct Recorder {
        endpoint: Option<Arc<UdpEndpoint>>,
        echo: bool,
        seen: UnboundedSender<Seen>,
    }

    impl UdpEvents for Recorder {
        fn on_received(&mut self, from: SocketAddr, data: &[u8]) {
            if self.echo {
                if let Some(endpoint) = &self.endpoint {
                    endpoint.send_to(from, data);
                }
            }
            let _ = self.seen.send(Seen::Received {
                from,
                data: data.to_vec(),
            });
        }

        fn on_joined_multicast_group(&mut self, address: &str) {
            let _ = self.seen.send(Seen::Joined(address.to_string()));
        }

        fn on_left_multicast_group(&mut self, address: &str) {
            let _ = self.seen.send(Seen::Left(address.to_string()));
        }
    }

    fn recorder(echo: bool) -> (UdpHandlerFactory, tokio::sync::mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = unbounded_channel();
        let factory: UdpHandlerFactory = Arc::new(move |endpoint| {
            Box::new(Recorder {
                endpoint: Some(endpoint),
                echo,
                seen: tx.clone(),
            })
        });
        (factory, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn datagram_roundtrip_reports_sender_endpoint() {
        let executor = Executor::current();

        let (echo_factory, _echo_rx) = recorder(true);
        let responder = UdpEndpoint::new(
            executor.clone(),
            UdpConfig::new("127.0.0.1:0".parse().unwrap()),
            echo_factory,
        );
        responder.connect().unwrap();
        let responder_port = responder.local_addr().unwrap().port();
        let responder_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), responder_port);

        let (factory, mut rx) = recorder(false);
        let requester = UdpEndpoint::new(executor, UdpConfig::new(responder_addr), factory);
        requester.connect().unwrap();

        assert!(requester.send(b"PING"));

        let seen = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no datagram back")
            .unwrap();
        match seen {
            Seen::Received { from, data } => {
                assert_eq!(data, b"PING");
                assert_eq!(from.port(), responder_port);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(requester.datagrams_sent(), 1);
        assert_eq!(requester.datagrams_received(), 1);
        assert_eq!(requester.bytes_received(), 4);
        assert_eq!(responder.datagrams_received(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn endpoint_disconnects_and_reconnects() {
        let executor = Executor::current();
        let (factory, _rx) = recorder(false);
        let endpoint = UdpEndpoint::new(
            executor,
            UdpConfig::new("127.0.0.1:9".parse().unwrap()),
            factory,
        );

        assert!(endpoint.connect().unwrap());
        assert!(!endpoint.connect().unwrap());
        assert!(endpoint.is_connected());

        let mut watch = endpoint.connected_watch();
        assert!(endpoint.disconnect(false));
        timeout(Duration::from_secs(5), watch.wait_for(|c| !c))
            .await
            .expect("disconnect never observed")
            .unwrap();

        assert!(endpoint.reconnect().await.unwrap());
        assert!(endpoint.is_connected());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multicast_join_and_receive() {
        let executor = Executor::current();
        let group: Ipv4Addr = "239.255.0.1".parse().unwrap();
        let port = 35491;

        let (factory, mut rx) = recorder(false);
        let mut config = UdpConfig::new(SocketAddr::new(IpAddr::V4(group), port));
        config.multicast = true;
        config.reuse_address = true;
        let receiver = UdpEndpoint::new(executor.clone(), config, factory);
        if receiver.connect().is_err() {
            eprintln!("multicast bind unavailable in this environment, skipping");
            return;
        }
        assert!(receiver.join_multicast_group(IpAddr::V4(group)));

        let joined = timeout(Duration::from_secs(5), rx.recv()).await;
        match joined {
            Ok(Some(Seen::Joined(address))) => assert_eq!(address, group.to_string()),
            _ => {
                eprintln!("multicast join unavailable in this environment, skipping");
                return;
            }
        }

        let (sender_factory, _sender_rx) = recorder(false);
        let sender = UdpEndpoint::new(
            executor,
            UdpConfig::new(SocketAddr::new(IpAddr::V4(group), port)),
            sender_factory,
        );
        sender.connect().unwrap();
        if !sender.send(b"PING") {
            eprintln!("multicast send unavailable in this environment, skipping");
            return;
        }

        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Seen::Received { data, .. })) => {
                assert_eq!(data, b"PING");
                assert_eq!(receiver.datagrams_received(), 1);
            }
            _ => eprintln!("multicast routing unavailable in this environment, skipping"),
        }

        assert!(receiver.leave_multicast_group(IpAddr::V4(group)));
    }
}
