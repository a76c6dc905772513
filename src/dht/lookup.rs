use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery};
use super::node::{Distance, Node, NodeId};
use super::routing::RoutingTable;
use super::task::{Task, TaskContext};
use super::tracker::ResponseHandler;
use crate::config::DhtConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Unqueried,
    Queried,
    Responded,
}

#[derive(Debug)]
struct Candidate {
    node: Node,
    distance: Distance,
    state: CandidateState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Querying,
    Finished,
}

#[derive(Debug)]
struct LookupState {
    target: NodeId,
    local_id: Option<NodeId>,
    k: usize,
    /// Sorted by ascending distance to the target.
    candidates: Vec<Candidate>,
    in_flight: usize,
    rounds: usize,
    /// Closest answered candidate when the current round started.
    responded_before_round: Option<Distance>,
    phase: Phase,
}

impl LookupState {
    fn insert(&mut self, node: Node) {
        if Some(node.id) == self.local_id || self.candidates.iter().any(|c| c.node.id == node.id) {
            return;
        }
        let distance = node.id.distance(&self.target);
        let pos = self.candidates.partition_point(|c| c.distance <= distance);
        self.candidates.insert(
            pos,
            Candidate {
                node,
                distance,
                state: CandidateState::Unqueried,
            },
        );
    }

    fn remove(&mut self, id: &NodeId) {
        self.candidates.retain(|c| &c.node.id != id);
    }

    fn best(&self) -> Option<Distance> {
        self.candidates.first().map(|c| c.distance)
    }

    fn best_responded(&self) -> Option<Distance> {
        self.candidates
            .iter()
            .find(|c| c.state == CandidateState::Responded)
            .map(|c| c.distance)
    }

    fn has_unqueried(&self) -> bool {
        self.closest()
            .iter()
            .any(|c| c.state == CandidateState::Unqueried)
    }

    fn closest(&self) -> &[Candidate] {
        &self.candidates[..self.candidates.len().min(self.k)]
    }

    fn finish(&mut self, reason: &str) {
        self.phase = Phase::Finished;
        debug!(
            "Lookup for {} finished after {} rounds ({}), {} candidates",
            self.target,
            self.rounds,
            reason,
            self.candidates.len()
        );
    }
}

/// Observes a running lookup.
#[derive(Clone)]
pub struct LookupHandle {
    state: Arc<Mutex<LookupState>>,
}

impl LookupHandle {
    pub fn target(&self) -> NodeId {
        self.state.lock().target
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().phase == Phase::Finished
    }

    pub fn rounds(&self) -> usize {
        self.state.lock().rounds
    }

    /// The best `k` nodes known so far, closest first.
    pub fn closest(&self) -> Vec<Node> {
        self.state
            .lock()
            .closest()
            .iter()
            .map(|c| c.node.clone())
            .collect()
    }
}

/// Resolves the lookup's tracker entries into its shared state.
struct LookupResponder {
    state: Arc<Mutex<LookupState>>,
}

impl ResponseHandler for LookupResponder {
    fn on_response(&self, target: &Node, response: &DhtMessage, table: &mut RoutingTable) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        let responder = Node::new(response.sender_id.unwrap_or(target.id), target.addr.clone());
        table.add_node(responder);

        let learned = response.as_response().map(|r| r.nodes()).unwrap_or_default();
        for node in learned {
            table.add_node(node.clone());
        }

        if state.phase == Phase::Finished {
            return;
        }
        if let Some(candidate) = state.candidates.iter_mut().find(|c| c.node.id == target.id) {
            candidate.state = CandidateState::Responded;
            candidate.node.touch();
        }
        for node in learned {
            state.insert(node.clone());
        }
    }

    fn on_failure(&self, target: &Node, error: &DhtError, table: &mut RoutingTable) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);

        if matches!(error, DhtError::Timeout) {
            table.mark_failed(&target.id);
        }
        if state.phase != Phase::Finished {
            state.remove(&target.id);
        }
    }
}

/// Iterative FIND_NODE lookup of one target id.
///
/// Each round queries up to `alpha` of the `k` closest candidates not asked
/// yet. Progress is measured against the closest candidate that had answered
/// when the round started; nodes that time out are dropped. Once every query of a round has resolved, the lookup stops
/// at the round cap, or when none of the `k` closest candidates is left
/// unqueried. A round that brought nothing closer only sweeps the remaining
/// unqueried nodes among the `k` closest.
pub struct NodeLookupTask {
    state: Arc<Mutex<LookupState>>,
    responder: Arc<LookupResponder>,
    alpha: usize,
    max_rounds: usize,
    timeout: Duration,
}

impl NodeLookupTask {
    pub fn new(target: NodeId, config: &DhtConfig) -> Self {
        let state = Arc::new(Mutex::new(LookupState {
            target,
            local_id: None,
            k: config.bucket_size,
            candidates: Vec::new(),
            in_flight: 0,
            rounds: 0,
            responded_before_round: None,
            phase: Phase::Idle,
        }));

        Self {
            responder: Arc::new(LookupResponder {
                state: Arc::clone(&state),
            }),
            state,
            alpha: config.alpha,
            max_rounds: config.max_lookup_rounds,
            timeout: config.message_timeout,
        }
    }

    pub fn handle(&self) -> LookupHandle {
        LookupHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn start_round(&self, state: &mut LookupState, ctx: &mut TaskContext<'_>) {
        let k = state.k;
        let batch: Vec<Node> = state
            .candidates
            .iter_mut()
            .take(k)
            .filter(|c| c.state == CandidateState::Unqueried)
            .take(self.alpha)
            .map(|c| {
                c.state = CandidateState::Queried;
                c.node.clone()
            })
            .collect();

        if batch.is_empty() {
            state.finish("no unqueried candidates");
            return;
        }

        state.rounds += 1;
        state.responded_before_round = state.best_responded();
        state.in_flight += batch.len();
        state.phase = Phase::Querying;

        let target = state.target;
        for node in batch {
            ctx.dispatcher.add_query_with_timeout(
                node,
                DhtQuery::FindNode { target },
                self.timeout,
                self.responder.clone(),
            );
        }
    }
}

impl Task for NodeLookupTask {
    fn startup(&mut self, ctx: &mut TaskContext<'_>) {
        let mut state = self.state.lock();
        state.local_id = Some(*ctx.table.local_id());
        for node in ctx.table.closest_nodes(&state.target, state.k) {
            state.insert(node);
        }
        self.start_round(&mut state, ctx);
    }

    fn resume(&mut self, ctx: &mut TaskContext<'_>) {
        let mut state = self.state.lock();
        if state.phase != Phase::Querying || state.in_flight > 0 {
            return;
        }

        let improved = match (state.responded_before_round, state.best()) {
            (None, Some(_)) => true,
            (Some(before), Some(now)) => now < before,
            (_, None) => false,
        };

        if state.rounds >= self.max_rounds {
            state.finish("round limit");
        } else if !state.has_unqueried() {
            state.finish(if improved {
                "closest nodes answered"
            } else {
                "no closer node"
            });
        } else {
            self.start_round(&mut state, ctx);
        }
    }

    fn is_finished(&self) -> bool {
        self.state.lock().phase == Phase::Finished
    }

    fn name(&self) -> &'static str {
        "node lookup"
    }
}
