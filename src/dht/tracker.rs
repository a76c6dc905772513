use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::error::DhtError;
use super::message::{DhtMessage, MessageKind, MessageType, TransactionId};
use super::node::Node;
use super::routing::RoutingTable;
use crate::socket::PeerAddr;

/// Receives the outcome of a tracked query. Exactly one of the two methods is
/// called per entry.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, target: &Node, response: &DhtMessage, table: &mut RoutingTable);

    fn on_failure(&self, target: &Node, error: &DhtError, table: &mut RoutingTable);
}

/// An outstanding query waiting for its reply.
pub struct TrackerEntry {
    target: Node,
    transaction_id: TransactionId,
    message_type: MessageType,
    dispatched_at: Instant,
    timeout: Duration,
    handler: Arc<dyn ResponseHandler>,
}

impl TrackerEntry {
    pub fn new(
        target: Node,
        transaction_id: TransactionId,
        message_type: MessageType,
        timeout: Duration,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            target,
            transaction_id,
            message_type,
            dispatched_at: Instant::now(),
            timeout,
            handler,
        }
    }

    pub fn target(&self) -> &Node {
        &self.target
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn handler(&self) -> &Arc<dyn ResponseHandler> {
        &self.handler
    }

    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed_millis_at(Instant::now())
    }

    pub fn elapsed_millis_at(&self, now: Instant) -> u128 {
        now.saturating_duration_since(self.dispatched_at).as_millis()
    }

    pub fn is_timeout(&self) -> bool {
        self.is_timeout_at(Instant::now())
    }

    pub fn is_timeout_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.dispatched_at) >= self.timeout
    }

    /// Restarts the dispatch clock.
    pub fn extend_timeout(&mut self) {
        self.dispatched_at = Instant::now();
    }

    fn matches(&self, transaction_id: &[u8], sender: &PeerAddr) -> bool {
        self.transaction_id.as_ref() == transaction_id
            && self.target.addr.host == sender.host
            && self.target.addr.port == sender.port
    }
}

/// Correlates replies with outstanding queries.
///
/// A reply matches only when both the transaction id and the sender's host and
/// port agree with an entry. Matching or timing out removes the entry, so each
/// one resolves exactly once.
pub struct MessageTracker {
    entries: Vec<TrackerEntry>,
    max_pending: usize,
}

impl MessageTracker {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_pending,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_pending
    }

    pub fn add_entry(
        &mut self,
        target: Node,
        transaction_id: TransactionId,
        message_type: MessageType,
        timeout: Duration,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<(), DhtError> {
        if self.is_full() {
            return Err(DhtError::RateLimited);
        }

        self.entries.push(TrackerEntry::new(
            target,
            transaction_id,
            message_type,
            timeout,
            handler,
        ));
        Ok(())
    }

    /// Removes and returns the entry matching `transaction_id` from `sender`.
    pub fn message_arrived(
        &mut self,
        transaction_id: &[u8],
        sender: &PeerAddr,
    ) -> Option<TrackerEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.matches(transaction_id, sender))?;
        Some(self.entries.swap_remove(pos))
    }

    pub fn extend_timeout(&mut self, transaction_id: &[u8], sender: &PeerAddr) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.matches(transaction_id, sender))
        {
            Some(entry) => {
                entry.extend_timeout();
                true
            }
            None => false,
        }
    }

    /// Resolves a decoded reply against its entry. Returns `false` when the
    /// message is a query or nothing was waiting for it.
    pub fn handle_response(
        &mut self,
        message: &DhtMessage,
        sender: &PeerAddr,
        table: &mut RoutingTable,
    ) -> bool {
        if message.is_query() {
            return false;
        }

        let Some(entry) = self.message_arrived(&message.transaction_id, sender) else {
            return false;
        };

        match &message.kind {
            MessageKind::Error { code, message: text } => {
                let error = DhtError::Remote {
                    code: *code,
                    message: text.clone(),
                };
                entry.handler.on_failure(&entry.target, &error, table);
            }
            _ => entry.handler.on_response(&entry.target, message, table),
        }
        true
    }

    pub fn sweep_timeouts(&mut self, table: &mut RoutingTable) -> usize {
        self.sweep_timeouts_at(Instant::now(), table)
    }

    /// Fails every entry whose timeout elapsed by `now`.
    pub fn sweep_timeouts_at(&mut self, now: Instant, table: &mut RoutingTable) -> usize {
        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.is_timeout_at(now));
        self.entries = pending;

        for entry in &expired {
            debug!(
                "{} query to {} timed out after {}ms",
                entry.message_type.as_str(),
                entry.target.addr,
                entry.elapsed_millis_at(now)
            );
            entry
                .handler
                .on_failure(&entry.target, &DhtError::Timeout, table);
        }

        expired.len()
    }
}
