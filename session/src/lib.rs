//! Reusable transport sessions over TCP, UDP and TLS-over-TCP.
//!
//! The core of the crate is the per-connection session engine: a state
//! machine that owns its socket, keeps at most one read and one write
//! outstanding, serializes application writes through a double buffer, and
//! delivers lifecycle downcalls (connected, handshaked, received, sent,
//! empty, disconnected, error) without data races. Servers accept sessions
//! into an id-keyed table and fan broadcasts out over it; clients drive a
//! single session with reconnect support; UDP endpoints add multicast and
//! synchronous datagram sends.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wireline_executor::Executor;
//! use wireline_session::{Server, ServerConfig, Session, SessionEvents};
//!
//! struct Echo {
//!     session: Arc<Session>,
//! }
//!
//! impl SessionEvents for Echo {
//!     fn on_received(&mut self, data: &[u8]) {
//!         self.session.send(data);
//!     }
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! # let runtime = tokio::runtime::Runtime::new()?;
//! # let _guard = runtime.enter();
//! let executor = Executor::current();
//! let config = ServerConfig::new("127.0.0.1:4444".parse()?);
//! let server = Server::new(
//!     executor,
//!     config,
//!     Arc::new(|session| Box::new(Echo { session })),
//! );
//! let address = server.start()?;
//! println!("echo server on {address}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod events;
pub mod server;
pub mod session;
pub mod transport;
pub mod udp;

pub use client::{Client, ClientConfig};
pub use error::{Error, ErrorClass};
pub use events::{ChannelEvents, SessionEvent, SessionEvents, UdpEvents};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionHandlerFactory, SessionSettings, SessionStats, CHUNK};
pub use transport::{tls, IoStream};
pub use udp::{UdpConfig, UdpEndpoint, UdpHandlerFactory};
