use std::io;
use thiserror::Error;

/// Failure to establish, maintain or use a network channel.
///
/// Every variant that originates in the OS or the TLS library carries its
/// error text.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("secure handshake failed: {0}")]
    Handshake(String),

    #[error("socket is not bound")]
    NotBound,

    #[error("socket is not connected")]
    NotConnected,

    #[error("operation requires a {0} socket")]
    WrongKind(&'static str),
}

impl TransportError {
    pub(crate) fn io(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| TransportError::Io { op, source }
    }

    /// True when the failed operation would have blocked on a non-blocking socket.
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::Io { source, .. } if source.kind() == io::ErrorKind::WouldBlock)
    }
}
