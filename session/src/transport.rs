//! TCP and TLS transport plumbing.
//!
//! Unifies plain and TLS-wrapped streams behind [`IoStream`] and centralizes
//! socket construction so the `reuse_address` / `reuse_port` / `no_delay` /
//! `keep_alive` options are applied in exactly one place.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Stream that is either plain TCP or TLS-wrapped, on either side of the
/// handshake.
pub enum IoStream {
    /// Plain TCP stream.
    Plain(TcpStream),
    /// Server-side TLS stream.
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Client-side TLS stream.
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl IoStream {
    /// Peer address of the underlying socket.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Whether this stream carries a TLS layer.
    pub fn is_tls(&self) -> bool {
        !matches!(self, IoStream::Plain(_))
    }
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Bind a TCP listener with the requested address-reuse options.
pub fn bind_tcp_listener(
    addr: SocketAddr,
    reuse_address: bool,
    reuse_port: bool,
) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Bind a UDP socket with the requested address-reuse options.
pub fn bind_udp_socket(
    addr: SocketAddr,
    reuse_address: bool,
    reuse_port: bool,
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Connect a TCP stream and apply per-stream options.
pub async fn connect_tcp(
    addr: SocketAddr,
    no_delay: bool,
    keep_alive: bool,
) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    apply_stream_options(&stream, no_delay, keep_alive)?;
    Ok(stream)
}

/// Apply `no_delay` and `keep_alive` to an accepted or connected stream.
pub fn apply_stream_options(
    stream: &TcpStream,
    no_delay: bool,
    keep_alive: bool,
) -> std::io::Result<()> {
    if no_delay {
        stream.set_nodelay(true)?;
    }
    if keep_alive {
        socket2::SockRef::from(stream).set_keepalive(true)?;
    }
    Ok(())
}

/// TLS configuration helpers built on rustls.
pub mod tls {
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    use crate::error::Error;

    /// Build a server configuration from PEM-encoded certificate chain and
    /// PKCS#8 private key.
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig, Error> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = parse_certs(cert_chain_pem)?;
        if certs.is_empty() {
            return Err(Error::Config(
                "no certificates found in certificate chain".into(),
            ));
        }
        let key = parse_key(private_key_pem)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(config)
    }

    /// Build a client configuration. With `ca_pem` the given roots are
    /// trusted; without it the root store is empty, so every handshake fails
    /// verification (useful for tests and for callers installing their own
    /// verifier afterwards).
    pub fn make_client_config(ca_pem: Option<&str>) -> Result<ClientConfig, Error> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        if let Some(pem) = ca_pem {
            for cert in parse_certs(pem)? {
                roots.add(cert)?;
            }
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Wrap a server configuration into an acceptor.
    pub fn acceptor(config: ServerConfig) -> TlsAcceptor {
        TlsAcceptor::from(Arc::new(config))
    }

    /// Wrap a client configuration into a connector.
    pub fn connector(config: ClientConfig) -> TlsConnector {
        TlsConnector::from(Arc::new(config))
    }

    /// Parse an SNI server name, falling back on failure to an error.
    pub fn server_name(name: &str) -> Result<ServerName<'static>, Error> {
        ServerName::try_from(name.to_owned())
            .map_err(|_| Error::InvalidAddress(format!("invalid server name: {name}")))
    }

    fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
        let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
        Ok(certs?)
    }

    fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, Error> {
        let keys: Result<Vec<_>, _> =
            rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes()).collect();
        let mut keys = keys?;
        if keys.is_empty() {
            return Err(Error::Config("no private key found".into()));
        }
        Ok(PrivateKeyDer::from(keys.remove(0)))
    }
}
