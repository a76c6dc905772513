//! Distributed Hash Table (BEP-5)
//!
//! A Kademlia overlay over the 160-bit id space. The pieces are owned by
//! [`DhtServer`] and driven from its single-threaded event loop:
//!
//! - [`RoutingTable`] holds an ordered arena of [`Bucket`]s that split around
//!   the local id.
//! - [`MessageDispatcher`] encodes queued queries, sends them and registers
//!   each with the [`MessageTracker`], which matches replies by transaction id
//!   and sender address and sweeps timeouts.
//! - [`TaskQueue`] runs cooperative [`Task`]s: the recurring
//!   [`BucketRefreshTask`] and the iterative [`NodeLookupTask`].
//! - [`persist`] reads and writes the routing table file.

mod bucket;
mod dispatcher;
mod error;
mod lookup;
mod message;
mod node;
pub mod persist;
mod refresh;
mod routing;
mod server;
mod task;
mod tracker;

pub use bucket::Bucket;
pub use dispatcher::{DatagramSink, MessageDispatcher};
pub use error::DhtError;
pub use lookup::{LookupHandle, NodeLookupTask};
pub use message::{
    DhtMessage, DhtQuery, DhtResponse, KrpcCodec, MessageCodec, MessageKind, MessageType,
    TransactionId, ERROR_GENERIC, ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL, ERROR_SERVER,
};
pub use node::{Distance, Node, NodeId};
pub use persist::SavedRoutingTable;
pub use refresh::BucketRefreshTask;
pub use routing::RoutingTable;
pub use server::DhtServer;
pub use task::{Task, TaskContext, TaskHandle, TaskQueue};
pub use tracker::{MessageTracker, ResponseHandler, TrackerEntry};

#[cfg(test)]
mod tests;
