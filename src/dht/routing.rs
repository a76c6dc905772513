use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;

use tracing::debug;

use super::bucket::Bucket;
use super::error::DhtError;
use super::node::{Node, NodeId};
use crate::config::DhtConfig;
use crate::constants::{BUCKET_REFRESH_INTERVAL, BUCKET_SIZE, NODE_ID_BITS};

/// Buckets spanning the whole id space, anchored at the local id.
///
/// The buckets live in one `Vec` sorted by range start. The table starts with
/// a single bucket; a full bucket that covers the local id is split in place
/// into its two halves.
pub struct RoutingTable {
    local_id: NodeId,
    bucket_size: usize,
    refresh_interval: Duration,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self::with_params(local_id, BUCKET_SIZE, BUCKET_REFRESH_INTERVAL)
    }

    pub fn from_config(local_id: NodeId, config: &DhtConfig) -> Self {
        Self::with_params(local_id, config.bucket_size, config.bucket_refresh_interval)
    }

    pub fn with_params(local_id: NodeId, bucket_size: usize, refresh_interval: Duration) -> Self {
        Self {
            local_id,
            bucket_size,
            refresh_interval,
            buckets: vec![Bucket::new(bucket_size, refresh_interval)],
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// The live buckets, ordered by range start.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn buckets_mut(&mut self) -> &mut [Bucket] {
        &mut self.buckets
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let idx = self.buckets.partition_point(|b| b.max().0 < id.0);
        idx.min(self.buckets.len() - 1)
    }

    pub fn find_bucket(&self, id: &NodeId) -> &Bucket {
        &self.buckets[self.bucket_index(id)]
    }

    pub fn find_bucket_mut(&mut self, id: &NodeId) -> &mut Bucket {
        let idx = self.bucket_index(id);
        &mut self.buckets[idx]
    }

    /// Inserts or refreshes `node`. Returns whether it is a member afterwards.
    ///
    /// A full bucket covering the local id is split and the insert retried.
    /// Any other full bucket replaces its least recently seen member only if
    /// that member is bad; otherwise the node goes to the replacement cache.
    pub fn add_node(&mut self, node: Node) -> bool {
        if node.id == self.local_id {
            return false;
        }

        loop {
            let idx = self.bucket_index(&node.id);
            let local_id = self.local_id;
            let bucket = &mut self.buckets[idx];
            let splittable = bucket.covers(&local_id) && bucket.prefix_len() < NODE_ID_BITS;

            if bucket.refresh(&node.id) {
                bucket.notify_update();
                return true;
            }

            if !bucket.is_full() {
                bucket.push(node);
                bucket.notify_update();
                return true;
            }

            if splittable {
                self.split(idx);
                continue;
            }

            return match bucket.replace_bad(node) {
                Ok(()) => {
                    bucket.notify_update();
                    true
                }
                Err(node) => {
                    bucket.cache_replacement(node);
                    false
                }
            };
        }
    }

    fn split(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let (lower, upper) = bucket.split();
        debug!(
            "Split bucket at prefix length {} ({} + {} nodes)",
            lower.prefix_len(),
            lower.len(),
            upper.len()
        );
        self.buckets.splice(idx..idx, [lower, upper]);
    }

    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        self.find_bucket_mut(id).remove(id)
    }

    /// Counts a failed query. A node that turns bad is evicted and replaced
    /// from its bucket's replacement cache.
    pub fn mark_failed(&mut self, id: &NodeId) {
        let bucket = self.find_bucket_mut(id);

        if let Some(node) = bucket.get_mut(id) {
            node.fail();

            if node.is_bad() {
                debug!("Evicting bad node {}", id);
                bucket.remove(id);
            }
        }
    }

    pub fn mark_seen(&mut self, id: &NodeId) {
        let bucket = self.find_bucket_mut(id);
        if bucket.refresh(id) {
            bucket.notify_update();
        }
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
        self.find_bucket(id).get(id)
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes().cloned())
            .collect()
    }

    /// Up to `k` nodes by ascending distance to `target`, most recently seen
    /// first among equals.
    pub fn closest_nodes(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut nodes: Vec<&Node> = self.buckets.iter().flat_map(|b| b.nodes()).collect();
        nodes.sort_by_key(|n| (n.id.distance(target), Reverse(n.last_seen)));
        nodes.into_iter().take(k).cloned().collect()
    }

    /// Like [`closest_nodes`](Self::closest_nodes), and counts as consulting
    /// the target's bucket and every bucket a result came from.
    pub fn closest_nodes_mut(&mut self, target: &NodeId, k: usize) -> Vec<Node> {
        let nodes = self.closest_nodes(target, k);
        self.find_bucket_mut(target).notify_update();
        for node in &nodes {
            self.find_bucket_mut(&node.id).notify_update();
        }
        nodes
    }

    /// Verifies coverage, ordering, capacity and membership of every bucket.
    pub fn check_invariants(&self) -> Result<(), DhtError> {
        let violation = |msg: String| Err(DhtError::InvariantViolation(msg));

        let (Some(first), Some(last)) = (self.buckets.first(), self.buckets.last()) else {
            return violation("no buckets".into());
        };
        if first.min() != &NodeId::MIN {
            return violation(format!("first bucket starts at {}", first.min()));
        }
        if last.max() != &NodeId::MAX {
            return violation(format!("last bucket ends at {}", last.max()));
        }

        for pair in self.buckets.windows(2) {
            if successor(pair[0].max()).as_ref() != Some(pair[1].min()) {
                return violation(format!(
                    "gap or overlap between {} and {}",
                    pair[0].max(),
                    pair[1].min()
                ));
            }
        }

        let mut seen = HashSet::new();
        for bucket in &self.buckets {
            if bucket.min().0 > bucket.max().0 {
                return violation(format!("empty range starting at {}", bucket.min()));
            }
            if bucket.len() > self.bucket_size {
                return violation(format!(
                    "bucket at {} holds {} nodes",
                    bucket.min(),
                    bucket.len()
                ));
            }
            for node in bucket.nodes() {
                if !bucket.covers(&node.id) {
                    return violation(format!("{} outside bucket at {}", node.id, bucket.min()));
                }
                if node.id == self.local_id {
                    return violation("local id stored in the table".into());
                }
                if !seen.insert(node.id) {
                    return violation(format!("{} stored twice", node.id));
                }
            }
        }

        Ok(())
    }
}

/// `id + 1`, `None` on overflow.
fn successor(id: &NodeId) -> Option<NodeId> {
    let mut next = *id;
    for byte in next.0.iter_mut().rev() {
        let (value, carry) = byte.overflowing_add(1);
        *byte = value;
        if !carry {
            return Some(next);
        }
    }
    None
}
