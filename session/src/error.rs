//! Endpoint error types and the disconnect-noise suppression policy.

use std::io;

use thiserror::Error;

/// Errors surfaced by sessions, servers and clients.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// TLS protocol failure outside the I/O path.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Certificate or key material could not be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,
}

/// How a failure affects the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced through `on_error`, then the session shuts down.
    Fatal,
    /// Expected end-of-connection noise (clean peer close, abort, EOF);
    /// the session shuts down silently.
    TerminalBenign,
    /// TLS chatter a peer emits while tearing a connection down (bad
    /// record MAC, protocol shutdown, wrong version number, truncation);
    /// the session shuts down silently.
    TlsBenign,
}

impl Error {
    /// Raw OS error code where one exists, otherwise 0.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(0),
            _ => 0,
        }
    }

    /// Coarse error category, mirroring the transport/TLS split.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Io(err) if rustls_cause(err).is_some() => "tls",
            Error::Io(_) => "system",
            Error::Tls(_) => "tls",
            _ => "generic",
        }
    }

    /// Classify this error's effect on the session lifecycle.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io(err) => io_class(err),
            Error::Tls(err) => tls_class(err),
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether this error is expected disconnect noise that must not reach
    /// user callbacks. Everything except [`ErrorClass::Fatal`] is
    /// suppressed.
    pub fn is_suppressed(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}

fn io_class(err: &io::Error) -> ErrorClass {
    if let Some(tls) = rustls_cause(err) {
        return tls_class(tls);
    }
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        // EOF and the missing-close_notify truncation both land here.
        | io::ErrorKind::UnexpectedEof
        // Reads/writes cancelled by a local disconnect.
        | io::ErrorKind::Interrupted => ErrorClass::TerminalBenign,
        _ => ErrorClass::Fatal,
    }
}

fn tls_class(err: &rustls::Error) -> ErrorClass {
    use rustls::AlertDescription;
    match err {
        // "decryption failed or bad record MAC"
        rustls::Error::DecryptError => ErrorClass::TlsBenign,
        // Clean close racing application data.
        rustls::Error::AlertReceived(AlertDescription::CloseNotify) => ErrorClass::TlsBenign,
        // "wrong version number" and friends from a peer speaking garbage
        // while the socket goes down.
        rustls::Error::PeerIncompatible(_) => ErrorClass::TlsBenign,
        _ => ErrorClass::Fatal,
    }
}

/// The rustls error wrapped inside an I/O error, when the failure came out
/// of the TLS layer.
pub(crate) fn rustls_cause(err: &io::Error) -> Option<&rustls::Error> {
    err.get_ref()?.downcast_ref::<rustls::Error>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_noise_is_suppressed() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err = Error::from(io::Error::new(kind, "boom"));
            assert_eq!(err.class(), ErrorClass::TerminalBenign);
            assert!(err.is_suppressed(), "{kind:?} should be suppressed");
        }
    }

    #[test]
    fn real_failures_are_not_suppressed() {
        let err = Error::from(io::Error::new(io::ErrorKind::AddrInUse, "busy"));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_suppressed());
        assert_eq!(err.category(), "system");

        let err = Error::Timeout;
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_suppressed());
        assert_eq!(err.category(), "generic");
    }

    #[test]
    fn tls_teardown_noise_is_suppressed() {
        let err = Error::from(rustls::Error::DecryptError);
        assert_eq!(err.class(), ErrorClass::TlsBenign);
        assert!(err.is_suppressed());
        assert_eq!(Error::from(rustls::Error::DecryptError).category(), "tls");

        let wrapped = io::Error::new(io::ErrorKind::InvalidData, rustls::Error::DecryptError);
        let wrapped = Error::from(wrapped);
        assert_eq!(wrapped.class(), ErrorClass::TlsBenign);
        assert!(wrapped.is_suppressed());

        let real = Error::from(rustls::Error::NoCertificatesPresented);
        assert_eq!(real.class(), ErrorClass::Fatal);
        assert!(!real.is_suppressed());
    }
}
