//! Protocol constants and tuning parameters.
//!
//! Defaults used by [`DhtConfig`](crate::config::DhtConfig). The values follow
//! BEP-5 and the defaults common BitTorrent clients ship with.

use std::time::Duration;

// ============================================================================
// Identifier space
// ============================================================================

/// Length of a node id in bytes (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// Number of bits in a node id.
pub const NODE_ID_BITS: usize = NODE_ID_LEN * 8;

// ============================================================================
// Routing table
// ============================================================================

/// Maximum number of nodes held by a bucket (Kademlia `K`).
pub const BUCKET_SIZE: usize = 8;

/// A bucket not consulted or repopulated for this long needs a refresh.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How often the refresh task scans the table for stale buckets.
pub const REFRESH_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Failed queries after which a node is considered bad.
pub const MAX_NODE_FAILURES: u8 = 3;

/// A node heard from within this window (and without failures) is good.
pub const NODE_GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

// ============================================================================
// Lookups and messaging
// ============================================================================

/// Queries dispatched in parallel per lookup round.
pub const LOOKUP_ALPHA: usize = 3;

/// Upper bound on the rounds of a single iterative lookup.
pub const MAX_LOOKUP_ROUNDS: usize = 10;

/// Time a remote node gets to answer a query.
pub const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of outstanding tracked queries.
pub const MAX_PENDING_QUERIES: usize = 256;

/// Tasks run concurrently in the immediate lane.
pub const IMMEDIATE_TASK_CONCURRENCY: usize = 8;

/// Tasks run concurrently in the periodic (maintenance) lane.
pub const PERIODIC_TASK_CONCURRENCY: usize = 4;

/// Largest UDP payload read from the socket.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Datagrams drained per event loop step before other work gets a turn.
pub const MAX_DATAGRAMS_PER_STEP: usize = 64;

// ============================================================================
// Persistence
// ============================================================================

/// How often the routing table is flushed to disk.
pub const ROUTING_TABLE_SAVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

// ============================================================================
// Ports and bootstrap
// ============================================================================

/// Default DHT listen port.
pub const DEFAULT_PORT: u16 = 6881;

/// Well-known routers used to join the overlay.
pub const BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];
