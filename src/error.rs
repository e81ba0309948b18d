//! Tunnel Error Types

use std::io;
use thiserror::Error;

/// Errors produced by the tunnel core
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Credentials were rejected by the server. Never retried.
    #[error("authentication failed")]
    AuthFailed,

    /// The multiplexed transport is closed or broken
    #[error("transport closed")]
    TransportClosed,

    /// The transport stopped answering keepalives
    #[error("transport timed out")]
    Timeout,

    #[error("network error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Upstream DNS server answered with a non-zero response code
    #[error("DNS error: {0}")]
    Dns(u8),

    #[error("no result")]
    NoResult,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("certificate error: {0}")]
    Certificate(String),
}

impl TunnelError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TunnelError::Protocol(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        TunnelError::Tls(msg.into())
    }

    pub fn certificate(msg: impl Into<String>) -> Self {
        TunnelError::Certificate(msg.into())
    }

    /// Whether retrying the same operation can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, TunnelError::AuthFailed)
    }

    /// Whether the error means the underlying transport is gone.
    /// Stream-level I/O errors never qualify.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, TunnelError::TransportClosed | TunnelError::Timeout)
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            TunnelError::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            TunnelError::TransportClosed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
