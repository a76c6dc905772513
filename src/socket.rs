//! Network transport for the overlay.
//!
//! [`TransportSocket`] wraps one stream or datagram socket with explicit
//! blocking-mode control, bounded readiness polling and an optional secure
//! channel. Secure streams keep a read-ahead buffer so that bytes returned by
//! [`TransportSocket::peek_data`] are exactly the bytes a later
//! [`TransportSocket::read_data`] consumes.
//!
//! The secure channel is pluggable through [`SecureChannel`]; the crate ships
//! a rustls client backend, [`TlsChannel`].

mod addr;
mod error;
mod secure;
mod tls;
mod transport;

pub use addr::PeerAddr;
pub use error::TransportError;
pub use secure::{HandshakeStatus, ReadWrite, SecureChannel, SecureStream};
pub use tls::TlsChannel;
pub use transport::{SocketKind, TransportSocket};
