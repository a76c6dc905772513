use thiserror::Error;

use crate::bencode::BencodeError;
use crate::config::ConfigError;
use crate::socket::TransportError;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    /// The remote node did not answer in time. Only ever delivered to a
    /// [`ResponseHandler`](super::ResponseHandler).
    #[error("timeout")]
    Timeout,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("rate limited")]
    RateLimited,

    /// A persisted node record without a usable numeric address. Dropped
    /// while loading, never returned from it.
    #[error("malformed persisted entry: {0}")]
    MalformedPersistedEntry(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("routing table invariant violated: {0}")]
    InvariantViolation(String),
}
