//! Session lifecycle downcalls.
//!
//! Two styles are offered: implement [`SessionEvents`] (or [`UdpEvents`])
//! directly, or take the tagged-event route with [`SessionEvent`] and the
//! channel-forwarding adapters and drain an mpsc receiver instead. Both are
//! invoked only from the session's serializer, so implementations never see
//! concurrent calls.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;

/// Downcalls for stream (TCP/TLS) sessions.
///
/// All methods default to no-ops; override what you need. `on_disconnected`
/// is always the final call for a given connect.
#[allow(unused_variables)]
pub trait SessionEvents: Send + 'static {
    /// The transport connected. TLS sessions continue to handshake.
    fn on_connected(&mut self) {}
    /// The TLS handshake completed; application data may flow. Not emitted
    /// for plain TCP sessions.
    fn on_handshaked(&mut self) {}
    /// Bytes arrived from the peer. The slice is only valid for the call.
    fn on_received(&mut self, data: &[u8]) {}
    /// A write completed. `pending` is what remains queued for transmission.
    fn on_sent(&mut self, sent: usize, pending: usize) {}
    /// Both send buffers drained; a good moment to produce more data.
    fn on_empty(&mut self) {}
    /// Final callback of the lifecycle.
    fn on_disconnected(&mut self) {}
    /// A non-suppressed transport or TLS failure.
    fn on_error(&mut self, error: &Error) {}
}

/// Downcalls for UDP endpoints.
#[allow(unused_variables)]
pub trait UdpEvents: Send + 'static {
    /// The socket is bound and receiving.
    fn on_connected(&mut self) {}
    /// The socket closed; final callback.
    fn on_disconnected(&mut self) {}
    /// A datagram arrived from `from`.
    fn on_received(&mut self, from: SocketAddr, data: &[u8]) {}
    /// A datagram left for `to`.
    fn on_sent(&mut self, to: SocketAddr, sent: usize) {}
    /// The endpoint joined a multicast group.
    fn on_joined_multicast_group(&mut self, address: &str) {}
    /// The endpoint left a multicast group.
    fn on_left_multicast_group(&mut self, address: &str) {}
    /// A non-suppressed socket failure.
    fn on_error(&mut self, error: &Error) {}
}

/// Tagged session lifecycle event, for users who prefer draining a channel
/// over implementing a trait.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport connected.
    Connected {
        /// Session id.
        id: Uuid,
    },
    /// TLS handshake completed.
    Handshaked {
        /// Session id.
        id: Uuid,
    },
    /// Bytes arrived.
    Received {
        /// Session id.
        id: Uuid,
        /// Copy of the received bytes.
        data: Vec<u8>,
    },
    /// A write completed.
    Sent {
        /// Session id.
        id: Uuid,
        /// Bytes written by this completion.
        sent: usize,
        /// Bytes still queued for transmission.
        pending: usize,
    },
    /// Send buffers drained.
    Empty {
        /// Session id.
        id: Uuid,
    },
    /// Non-suppressed failure.
    Error {
        /// Session id.
        id: Uuid,
        /// OS error code, 0 when not applicable.
        code: i32,
        /// Error category ("system", "tls", "generic").
        category: &'static str,
        /// Human-readable message.
        message: String,
    },
    /// Lifecycle finished.
    Disconnected {
        /// Session id.
        id: Uuid,
    },
}

/// [`SessionEvents`] implementation that forwards every downcall onto an
/// unbounded channel as a [`SessionEvent`].
#[derive(Debug)]
pub struct ChannelEvents {
    id: Uuid,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEvents {
    /// Forward the downcalls of session `id` into `events`.
    pub fn new(id: Uuid, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { id, events }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl SessionEvents for ChannelEvents {
    fn on_connected(&mut self) {
        self.emit(SessionEvent::Connected { id: self.id });
    }

    fn on_handshaked(&mut self) {
        self.emit(SessionEvent::Handshaked { id: self.id });
    }

    fn on_received(&mut self, data: &[u8]) {
        self.emit(SessionEvent::Received {
            id: self.id,
            data: data.to_vec(),
        });
    }

    fn on_sent(&mut self, sent: usize, pending: usize) {
        self.emit(SessionEvent::Sent {
            id: self.id,
            sent,
            pending,
        });
    }

    fn on_empty(&mut self) {
        self.emit(SessionEvent::Empty { id: self.id });
    }

    fn on_disconnected(&mut self) {
        self.emit(SessionEvent::Disconnected { id: self.id });
    }

    fn on_error(&mut self, error: &Error) {
        self.emit(SessionEvent::Error {
            id: self.id,
            code: error.code(),
            category: error.category(),
            message: error.to_string(),
        });
    }
}
