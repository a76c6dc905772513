//! Runtime configuration for the DHT overlay.
//!
//! [`DhtConfig`] starts from the defaults in [`constants`](crate::constants)
//! and is adjusted with a fluent API:
//!
//! ```
//! use rdht::config::DhtConfig;
//! use std::time::Duration;
//!
//! let config = DhtConfig::default()
//!     .with_port(0)
//!     .with_alpha(4)
//!     .with_message_timeout(Duration::from_secs(5));
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    BOOTSTRAP_NODES, BUCKET_REFRESH_INTERVAL, BUCKET_SIZE, DEFAULT_PORT,
    IMMEDIATE_TASK_CONCURRENCY, LOOKUP_ALPHA, MAX_LOOKUP_ROUNDS, MAX_PENDING_QUERIES,
    MESSAGE_TIMEOUT, PERIODIC_TASK_CONCURRENCY, REFRESH_CHECK_INTERVAL,
    ROUTING_TABLE_SAVE_INTERVAL,
};

/// Errors reported by [`DhtConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A count that must be at least one was zero.
    #[error("{0} must be greater than zero")]
    ZeroCount(&'static str),

    /// An interval that must be positive was zero.
    #[error("{0} must be a positive duration")]
    ZeroInterval(&'static str),

    /// Alpha larger than the bucket size can never be filled.
    #[error("alpha ({alpha}) must not exceed the bucket size ({k})")]
    AlphaTooLarge { alpha: usize, k: usize },
}

/// Configuration of a DHT node.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// UDP port to bind (0 picks an ephemeral port).
    pub port: u16,
    /// Bucket capacity `K`, also the size of lookup result sets.
    pub bucket_size: usize,
    /// Parallel queries per lookup round.
    pub alpha: usize,
    /// Maximum rounds of an iterative lookup.
    pub max_lookup_rounds: usize,
    /// Staleness interval after which a bucket is refreshed.
    pub bucket_refresh_interval: Duration,
    /// Cadence of the bucket refresh task.
    pub refresh_check_interval: Duration,
    /// Per-query timeout used by the message tracker.
    pub message_timeout: Duration,
    /// Maximum outstanding tracked queries.
    pub max_pending_queries: usize,
    /// Concurrency of the immediate task lane.
    pub immediate_task_concurrency: usize,
    /// Concurrency of the periodic task lane.
    pub periodic_task_concurrency: usize,
    /// Where the routing table is persisted, if anywhere.
    pub routing_table_path: Option<PathBuf>,
    /// Interval between routing table flushes.
    pub save_interval: Duration,
    /// `host:port` entries pinged when joining the overlay.
    pub bootstrap_nodes: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bucket_size: BUCKET_SIZE,
            alpha: LOOKUP_ALPHA,
            max_lookup_rounds: MAX_LOOKUP_ROUNDS,
            bucket_refresh_interval: BUCKET_REFRESH_INTERVAL,
            refresh_check_interval: REFRESH_CHECK_INTERVAL,
            message_timeout: MESSAGE_TIMEOUT,
            max_pending_queries: MAX_PENDING_QUERIES,
            immediate_task_concurrency: IMMEDIATE_TASK_CONCURRENCY,
            periodic_task_concurrency: PERIODIC_TASK_CONCURRENCY,
            routing_table_path: None,
            save_interval: ROUTING_TABLE_SAVE_INTERVAL,
            bootstrap_nodes: BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DhtConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.bucket_size = k;
        self
    }

    pub fn with_alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_max_lookup_rounds(mut self, rounds: usize) -> Self {
        self.max_lookup_rounds = rounds;
        self
    }

    pub fn with_bucket_refresh_interval(mut self, interval: Duration) -> Self {
        self.bucket_refresh_interval = interval;
        self
    }

    pub fn with_refresh_check_interval(mut self, interval: Duration) -> Self {
        self.refresh_check_interval = interval;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_max_pending_queries(mut self, max: usize) -> Self {
        self.max_pending_queries = max;
        self
    }

    pub fn with_routing_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.routing_table_path = Some(path.into());
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    /// Replaces the bootstrap list. An empty list disables bootstrapping.
    pub fn with_bootstrap_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Checks that every count is non-zero and every interval positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("bucket size", self.bucket_size),
            ("alpha", self.alpha),
            ("max lookup rounds", self.max_lookup_rounds),
            ("max pending queries", self.max_pending_queries),
            ("immediate task concurrency", self.immediate_task_concurrency),
            ("periodic task concurrency", self.periodic_task_concurrency),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::ZeroCount(name));
            }
        }

        let intervals = [
            ("bucket refresh interval", self.bucket_refresh_interval),
            ("refresh check interval", self.refresh_check_interval),
            ("message timeout", self.message_timeout),
            ("save interval", self.save_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.alpha > self.bucket_size {
            return Err(ConfigError::AlphaTooLarge {
                alpha: self.alpha,
                k: self.bucket_size,
            });
        }

        Ok(())
    }
}
