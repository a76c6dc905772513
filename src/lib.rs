//! rdht - A Kademlia DHT peer discovery library
//!
//! This library implements the BitTorrent DHT node discovery overlay ([BEP-5])
//! on top of a small socket layer that speaks plaintext or TLS.
//!
//! # Modules
//!
//! - [`socket`] - Stream and datagram sockets with explicit blocking control and TLS
//! - [`bencode`] - BEP-3 Bencode encoding/decoding for KRPC messages
//! - [`dht`] - BEP-5 routing table, message tracking, lookups and persistence
//! - [`config`] - Runtime configuration
//! - [`constants`] - Protocol constants and defaults
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

pub mod bencode;
pub mod config;
pub mod constants;
pub mod dht;
pub mod socket;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{ConfigError, DhtConfig};
pub use dht::{
    DhtError, DhtMessage, DhtServer, LookupHandle, Node, NodeId, RoutingTable, SavedRoutingTable,
};
pub use socket::{PeerAddr, TransportError, TransportSocket};
