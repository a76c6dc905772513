use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::node::{Node, NodeId};

/// Nodes whose ids share the first `prefix_len` bits.
///
/// The range is `[min, max]` inclusive. Members are kept least recently seen
/// first. Nodes turned away while the bucket is full wait in a replacement
/// cache of the same capacity.
#[derive(Debug, Clone)]
pub struct Bucket {
    prefix_len: usize,
    min: NodeId,
    max: NodeId,
    capacity: usize,
    nodes: VecDeque<Node>,
    replacement_cache: VecDeque<Node>,
    last_updated: Instant,
    refresh_interval: Duration,
}

impl Bucket {
    /// A bucket covering the whole id space.
    pub fn new(capacity: usize, refresh_interval: Duration) -> Self {
        Self {
            prefix_len: 0,
            min: NodeId::MIN,
            max: NodeId::MAX,
            capacity,
            nodes: VecDeque::with_capacity(capacity),
            replacement_cache: VecDeque::new(),
            last_updated: Instant::now(),
            refresh_interval,
        }
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn min(&self) -> &NodeId {
        &self.min
    }

    pub fn max(&self) -> &NodeId {
        &self.max
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    pub fn covers(&self, id: &NodeId) -> bool {
        self.min.0 <= id.0 && id.0 <= self.max.0
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn replacement_cache(&self) -> impl Iterator<Item = &Node> {
        self.replacement_cache.iter()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Instant::now())
    }

    pub fn needs_refresh_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) > self.refresh_interval
    }

    /// Resets the staleness clock. Called whenever the bucket is consulted or
    /// repopulated.
    pub fn notify_update(&mut self) {
        self.last_updated = Instant::now();
    }

    /// Uniformly random id inside this bucket's range.
    pub fn random_node_id(&self) -> NodeId {
        NodeId::random_with_prefix(&self.min, self.prefix_len)
    }

    /// Touches an existing member and moves it to the most recently seen end.
    pub(crate) fn refresh(&mut self, id: &NodeId) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| &n.id == id) else {
            return false;
        };
        if let Some(mut existing) = self.nodes.remove(pos) {
            existing.touch();
            self.nodes.push_back(existing);
        }
        true
    }

    pub(crate) fn push(&mut self, node: Node) {
        debug_assert!(!self.is_full());
        self.nodes.push_back(node);
    }

    /// Replaces the least recently seen member if it has gone bad.
    pub(crate) fn replace_bad(&mut self, node: Node) -> Result<(), Node> {
        if !self.nodes.front().is_some_and(Node::is_bad) {
            return Err(node);
        }
        self.nodes.pop_front();
        self.nodes.push_back(node);
        Ok(())
    }

    pub(crate) fn cache_replacement(&mut self, node: Node) {
        self.replacement_cache.retain(|n| n.id != node.id);
        if self.replacement_cache.len() >= self.capacity {
            self.replacement_cache.pop_front();
        }
        self.replacement_cache.push_back(node);
    }

    /// Removes a member, promoting the freshest cached replacement.
    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        let removed = self.nodes.remove(pos);

        if let Some(replacement) = self.replacement_cache.pop_back() {
            self.nodes.push_back(replacement);
        }

        removed
    }

    /// Splits into the lower and upper half of the range.
    pub(crate) fn split(self) -> (Bucket, Bucket) {
        let bit = self.prefix_len;
        let prefix_len = bit + 1;

        let mut lower = Bucket {
            prefix_len,
            min: self.min,
            max: NodeId::MAX.with_prefix(&self.min, prefix_len),
            capacity: self.capacity,
            nodes: VecDeque::with_capacity(self.capacity),
            replacement_cache: VecDeque::new(),
            last_updated: self.last_updated,
            refresh_interval: self.refresh_interval,
        };
        let mut upper = Bucket {
            min: self.min.with_bit(bit, true),
            max: self.max,
            ..lower.clone()
        };

        for node in self.nodes {
            if node.id.bit(bit) {
                upper.nodes.push_back(node);
            } else {
                lower.nodes.push_back(node);
            }
        }
        for node in self.replacement_cache {
            if node.id.bit(bit) {
                upper.replacement_cache.push_back(node);
            } else {
                lower.replacement_cache.push_back(node);
            }
        }

        (lower, upper)
    }
}
