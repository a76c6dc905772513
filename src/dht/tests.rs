use super::*;
use crate::config::DhtConfig;
use crate::socket::{PeerAddr, TransportError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn addr(i: u32) -> PeerAddr {
    let [a, b, c, d] = (0x0A00_0000 + i).to_be_bytes();
    PeerAddr::new(format!("{}.{}.{}.{}", a, b, c, d), 6881)
}

fn node(id: NodeId, i: u32) -> Node {
    Node::new(id, addr(i))
}

fn id_with_first_byte(byte: u8) -> NodeId {
    let mut id = NodeId::generate();
    id.0[0] = byte;
    id
}

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1.0, id2.0);
}

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);

    assert!(matches!(
        NodeId::from_bytes(&[1u8; 10]),
        Err(DhtError::InvalidNodeId)
    ));
    assert!(NodeId::from_bytes(&[1u8; 21]).is_err());
}

#[test]
fn test_node_id_distance() {
    let id1 = NodeId([0u8; 20]);
    let id2 = NodeId([0xFF; 20]);

    assert_eq!(id1.distance(&id2).0, [0xFF; 20]);
    assert!(id1.distance(&id1).is_zero());
    assert_eq!(id1.distance(&id2), id2.distance(&id1));

    let mut near = [0u8; 20];
    near[19] = 1;
    let mut far = [0u8; 20];
    far[0] = 1;
    assert!(id1.distance(&NodeId(near)) < id1.distance(&NodeId(far)));
    assert_eq!(id1.distance(&NodeId(far)).leading_zeros(), 7);
    assert_eq!(id1.distance(&NodeId(near)).leading_zeros(), 159);
}

#[test]
fn test_node_id_prefix() {
    let prefix = NodeId([0b1010_1010; 20]);
    let id = NodeId([0u8; 20]).with_prefix(&prefix, 12);
    assert_eq!(id.0[0], 0b1010_1010);
    assert_eq!(id.0[1], 0b1010_0000);
    assert!(id.0[2..].iter().all(|&b| b == 0));

    assert!(prefix.bit(0));
    assert!(!prefix.bit(1));
    assert!(!NodeId::MIN.with_bit(0, true).with_bit(0, false).bit(0));

    for _ in 0..50 {
        let random = NodeId::random_with_prefix(&prefix, 20);
        assert!(random.distance(&prefix).leading_zeros() >= 20);
    }
}

#[test]
fn test_node_compact() {
    let id = NodeId([1u8; 20]);
    let node = Node::new(id, PeerAddr::new("127.0.0.1", 6881));

    let compact = node.to_compact().unwrap();
    assert_eq!(compact.len(), 26);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, id);
    assert_eq!(parsed.addr, node.addr);

    let v6 = Node::new(id, PeerAddr::new("2001:db8::1", 51413));
    let compact = v6.to_compact().unwrap();
    assert_eq!(compact.len(), 38);
    assert_eq!(Node::from_compact(&compact).unwrap().addr, v6.addr);

    let named = Node::new(id, PeerAddr::new("router.example", 6881));
    assert!(named.to_compact().is_none());
    assert!(Node::from_compact(&compact[..30]).is_none());
}

#[test]
fn test_node_state() {
    let mut node = node(NodeId::generate(), 1);

    assert!(node.is_good());
    assert!(!node.is_bad());

    node.fail();
    assert!(!node.is_good());
    node.fail();
    node.fail();
    assert!(node.is_bad());

    node.touch();
    assert!(node.is_good());
    assert_eq!(node.failures, 0);
}

#[test]
fn test_bucket_split_halves_range() {
    let mut bucket = Bucket::new(8, Duration::from_secs(60));
    for i in 0..8u8 {
        bucket.push(node(id_with_first_byte(i * 32), u32::from(i)));
    }

    let (lower, upper) = bucket.split();
    assert_eq!(lower.prefix_len(), 1);
    assert_eq!(upper.prefix_len(), 1);
    assert_eq!(lower.min(), &NodeId::MIN);
    assert_eq!(lower.max().0[0], 0x7F);
    assert!(lower.max().0[1..].iter().all(|&b| b == 0xFF));
    assert_eq!(upper.min().0[0], 0x80);
    assert!(upper.min().0[1..].iter().all(|&b| b == 0));
    assert_eq!(upper.max(), &NodeId::MAX);

    assert_eq!(lower.len(), 4);
    assert_eq!(upper.len(), 4);
    assert!(lower.nodes().all(|n| lower.covers(&n.id)));
    assert!(upper.nodes().all(|n| upper.covers(&n.id)));
}

#[test]
fn test_bucket_random_node_id_in_range() {
    let local = NodeId([0u8; 20]);
    let mut table = RoutingTable::new(local);
    for i in 0..200 {
        table.add_node(node(NodeId::generate(), i));
    }
    assert!(table.bucket_count() > 1);

    for bucket in table.buckets() {
        for _ in 0..20 {
            assert!(bucket.covers(&bucket.random_node_id()));
        }
    }
}

#[test]
fn test_routing_table_add() {
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id);

    for i in 0..10 {
        table.add_node(node(NodeId::generate(), i));
    }

    assert!(table.node_count() > 0);
    assert!(!table.add_node(node(our_id, 99)));
    assert!(table.find_node(&our_id).is_none());
    table.check_invariants().unwrap();
}

#[test]
fn test_routing_table_invariants_under_load() {
    let mut table = RoutingTable::new(NodeId::generate());

    for i in 0..2000 {
        table.add_node(node(NodeId::generate(), i));
        if i % 100 == 0 {
            table.check_invariants().unwrap();
        }
    }

    table.check_invariants().unwrap();
    assert!(table.bucket_count() > 1);
    assert!(table.buckets().iter().all(|b| b.len() <= 8));
    assert_eq!(table.all_nodes().len(), table.node_count());
}

#[test]
fn test_routing_table_refreshes_existing() {
    let mut table = RoutingTable::new(NodeId::MIN);
    let id = id_with_first_byte(0x80);
    assert!(table.add_node(node(id, 1)));
    table.mark_failed(&id);
    assert_eq!(table.find_node(&id).unwrap().failures, 1);

    assert!(table.add_node(node(id, 1)));
    assert_eq!(table.node_count(), 1);
    assert_eq!(table.find_node(&id).unwrap().failures, 0);
}

#[test]
fn test_full_far_bucket_uses_replacement_cache() {
    let local = NodeId::MIN;
    let mut table = RoutingTable::new(local);

    // Fill the upper half: after the first split it no longer covers the local id.
    let far: Vec<NodeId> = (0..8u8).map(|i| id_with_first_byte(0x80 | i)).collect();
    for (i, id) in far.iter().enumerate() {
        table.add_node(node(*id, i as u32));
    }
    for i in 0..8u8 {
        table.add_node(node(id_with_first_byte(i), 100 + u32::from(i)));
    }

    let upper = table.find_bucket(&far[0]);
    assert_eq!(upper.len(), 8);
    assert!(!upper.covers(&local));
    assert_eq!(upper.replacement_cache().count(), 0);

    let extra = id_with_first_byte(0xF0);
    assert!(!table.add_node(node(extra, 50)));
    assert!(table.find_node(&extra).is_none());
    assert_eq!(table.find_bucket(&extra).replacement_cache().count(), 1);

    // Least recently seen member goes bad: it is evicted and the cached node
    // takes its place.
    let oldest = table.find_bucket(&far[0]).nodes().next().unwrap().id;
    for _ in 0..3 {
        table.mark_failed(&oldest);
    }
    assert!(table.find_node(&oldest).is_none());
    assert!(table.find_node(&extra).is_some());
    table.check_invariants().unwrap();
}

#[test]
fn test_bad_least_recently_seen_is_replaced() {
    let mut table = RoutingTable::with_params(NodeId::MIN, 2, Duration::from_secs(60));
    let a = id_with_first_byte(0x81);
    let b = id_with_first_byte(0x82);
    let c = id_with_first_byte(0x83);
    let low = id_with_first_byte(0x01);

    table.add_node(node(low, 0));
    table.add_node(node(a, 1));
    table.add_node(node(b, 2));
    assert!(!table.find_bucket(&a).covers(&NodeId::MIN));

    table.find_bucket_mut(&a).get_mut(&a).unwrap().failures = 3;
    assert!(table.add_node(node(c, 3)));
    assert!(table.find_node(&a).is_none());
    assert!(table.find_node(&b).is_some());
    assert!(table.find_node(&c).is_some());
}

#[test]
fn test_closest_nodes_ordering() {
    let mut table = RoutingTable::new(NodeId::generate());
    for i in 0..300 {
        table.add_node(node(NodeId::generate(), i));
    }

    let target = NodeId::generate();
    let closest = table.closest_nodes(&target, 8);
    assert_eq!(closest.len(), 8);

    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }

    let worst = closest[7].id.distance(&target);
    let returned: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
    for other in table.all_nodes() {
        if !returned.contains(&other.id) {
            assert!(other.id.distance(&target) >= worst);
        }
    }

    assert!(table.closest_nodes(&target, 0).is_empty());
    assert_eq!(
        table.closest_nodes(&target, 10_000).len(),
        table.node_count()
    );
}

#[test]
fn test_closest_nodes_includes_exact_match() {
    let mut table = RoutingTable::new(NodeId::generate());
    let target = NodeId::generate();
    table.add_node(node(target, 1));
    for i in 2..50 {
        table.add_node(node(NodeId::generate(), i));
    }

    let closest = table.closest_nodes(&target, 3);
    assert_eq!(closest[0].id, target);
    assert!(closest[0].id.distance(&target).is_zero());
}

#[test]
fn test_closest_nodes_mut_notifies_buckets() {
    let mut table = RoutingTable::with_params(NodeId::MIN, 8, Duration::from_millis(20));
    table.add_node(node(id_with_first_byte(0x90), 1));
    std::thread::sleep(Duration::from_millis(30));
    assert!(table.buckets()[0].needs_refresh());

    table.closest_nodes_mut(&NodeId::MAX, 8);
    assert!(!table.buckets()[0].needs_refresh());
}

#[test]
fn test_check_invariants_detects_misplaced_node() {
    let mut table = RoutingTable::with_params(NodeId::MIN, 2, Duration::from_secs(60));
    table.add_node(node(id_with_first_byte(0x01), 1));
    table.add_node(node(id_with_first_byte(0x81), 2));
    table.add_node(node(id_with_first_byte(0x82), 3));
    assert_eq!(table.bucket_count(), 2);
    table.check_invariants().unwrap();

    table
        .find_bucket_mut(&NodeId::MIN)
        .push(node(id_with_first_byte(0xF5), 4));
    assert!(matches!(
        table.check_invariants(),
        Err(DhtError::InvariantViolation(_))
    ));
}

// ---------------------------------------------------------------------------
// Message tracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CountingHandler {
    responses: AtomicUsize,
    failures: AtomicUsize,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl ResponseHandler for CountingHandler {
    fn on_response(&self, _target: &Node, _response: &DhtMessage, _table: &mut RoutingTable) {
        self.responses.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failure(&self, _target: &Node, error: &DhtError, _table: &mut RoutingTable) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(error.to_string());
    }
}

impl CountingHandler {
    fn counts(&self) -> (usize, usize) {
        (
            self.responses.load(Ordering::SeqCst),
            self.failures.load(Ordering::SeqCst),
        )
    }
}

fn tid(value: &'static [u8]) -> TransactionId {
    bytes::Bytes::from_static(value)
}

#[test]
fn test_tracker_matches_id_and_sender() {
    let mut tracker = MessageTracker::new(16);
    let handler = Arc::new(CountingHandler::default());
    let target = node(NodeId::generate(), 1);

    tracker
        .add_entry(
            target.clone(),
            tid(b"aa"),
            MessageType::Ping,
            Duration::from_secs(10),
            handler.clone(),
        )
        .unwrap();

    assert!(tracker.message_arrived(b"bb", &target.addr).is_none());
    assert!(tracker.message_arrived(b"aa", &addr(2)).is_none());
    assert!(tracker
        .message_arrived(b"aa", &PeerAddr::new(target.addr.host.clone(), 6882))
        .is_none());
    assert_eq!(tracker.len(), 1);

    let entry = tracker.message_arrived(b"aa", &target.addr).unwrap();
    assert_eq!(entry.target().id, target.id);
    assert_eq!(entry.message_type(), MessageType::Ping);
    assert!(tracker.is_empty());
    assert!(tracker.message_arrived(b"aa", &target.addr).is_none());
}

#[test]
fn test_tracker_resolves_each_entry_once() {
    let mut table = RoutingTable::new(NodeId::generate());
    let mut tracker = MessageTracker::new(16);
    let answered = Arc::new(CountingHandler::default());
    let silent = Arc::new(CountingHandler::default());
    let a = node(NodeId::generate(), 1);
    let b = node(NodeId::generate(), 2);
    let timeout = Duration::from_secs(10);

    tracker
        .add_entry(a.clone(), tid(b"t1"), MessageType::Ping, timeout, answered.clone())
        .unwrap();
    tracker
        .add_entry(b.clone(), tid(b"t2"), MessageType::Ping, timeout, silent.clone())
        .unwrap();

    let reply = DhtMessage::ping_response(tid(b"t1"), &a.id);
    assert!(tracker.handle_response(&reply, &a.addr, &mut table));
    assert!(!tracker.handle_response(&reply, &a.addr, &mut table));

    let later = Instant::now() + timeout;
    assert_eq!(tracker.sweep_timeouts_at(later, &mut table), 1);
    assert_eq!(tracker.sweep_timeouts_at(later, &mut table), 0);

    let late = DhtMessage::ping_response(tid(b"t2"), &b.id);
    assert!(!tracker.handle_response(&late, &b.addr, &mut table));

    assert_eq!(answered.counts(), (1, 0));
    assert_eq!(silent.counts(), (0, 1));
    assert_eq!(silent.last_error.lock().as_deref(), Some("timeout"));
}

#[test]
fn test_tracker_entry_timing() {
    let target = node(NodeId::generate(), 1);
    let mut entry = TrackerEntry::new(
        target,
        tid(b"xy"),
        MessageType::FindNode,
        Duration::from_secs(5),
        Arc::new(CountingHandler::default()),
    );

    let now = Instant::now();
    assert!(!entry.is_timeout_at(now));
    assert!(entry.is_timeout_at(now + Duration::from_secs(5)));
    assert!(entry.elapsed_millis_at(now + Duration::from_millis(1500)) >= 1500);

    std::thread::sleep(Duration::from_millis(20));
    let before_extend = entry.elapsed_millis();
    assert!(before_extend >= 20);
    entry.extend_timeout();
    assert!(entry.elapsed_millis() < before_extend);
}

#[test]
fn test_tracker_extend_timeout() {
    let mut table = RoutingTable::new(NodeId::generate());
    let mut tracker = MessageTracker::new(16);
    let handler = Arc::new(CountingHandler::default());
    let target = node(NodeId::generate(), 1);

    tracker
        .add_entry(
            target.clone(),
            tid(b"ex"),
            MessageType::Ping,
            Duration::from_millis(50),
            handler.clone(),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(60));
    assert!(tracker.extend_timeout(b"ex", &target.addr));
    assert!(!tracker.extend_timeout(b"ex", &addr(9)));
    assert_eq!(tracker.sweep_timeouts(&mut table), 0);
    assert_eq!(tracker.len(), 1);
}

#[test]
fn test_tracker_remote_error_and_rate_limit() {
    let mut table = RoutingTable::new(NodeId::generate());
    let mut tracker = MessageTracker::new(1);
    let handler = Arc::new(CountingHandler::default());
    let target = node(NodeId::generate(), 1);

    tracker
        .add_entry(
            target.clone(),
            tid(b"e1"),
            MessageType::FindNode,
            Duration::from_secs(10),
            handler.clone(),
        )
        .unwrap();
    assert!(tracker.is_full());
    assert!(matches!(
        tracker.add_entry(
            target.clone(),
            tid(b"e2"),
            MessageType::Ping,
            Duration::from_secs(10),
            handler.clone(),
        ),
        Err(DhtError::RateLimited)
    ));

    let query = DhtMessage::ping(tid(b"e1"), &target.id);
    assert!(!tracker.handle_response(&query, &target.addr, &mut table));

    let error = DhtMessage::error(tid(b"e1"), ERROR_PROTOCOL, "Protocol Error");
    assert!(tracker.handle_response(&error, &target.addr, &mut table));
    assert_eq!(handler.counts(), (0, 1));
    assert_eq!(
        handler.last_error.lock().as_deref(),
        Some("remote error 203: Protocol Error")
    );
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[test]
fn test_codec_query_round_trip() {
    let mut codec = KrpcCodec::new();
    let our_id = NodeId::generate();
    let target = NodeId::generate();

    let tid = codec.next_transaction_id();
    let data = codec
        .encode(&DhtMessage::find_node(tid.clone(), &our_id, target))
        .unwrap();
    let decoded = codec.decode(&data).unwrap();

    assert_eq!(decoded.transaction_id, tid);
    assert_eq!(decoded.sender_id, Some(our_id));
    assert!(matches!(
        decoded.kind,
        MessageKind::Query(DhtQuery::FindNode { target: t }) if t == target
    ));

    let ping = codec
        .encode(&DhtMessage::ping(tid.clone(), &our_id))
        .unwrap();
    assert!(ping.starts_with(b"d1:ad2:id20:"));
    assert!(matches!(
        codec.decode(&ping).unwrap().kind,
        MessageKind::Query(DhtQuery::Ping)
    ));
}

#[test]
fn test_codec_find_node_response() {
    let codec = KrpcCodec::new();
    let our_id = NodeId::generate();
    let nodes = vec![
        node(NodeId::generate(), 1),
        Node::new(NodeId::generate(), PeerAddr::new("2001:db8::7", 7000)),
        Node::new(NodeId::generate(), PeerAddr::new("not-numeric", 7001)),
    ];

    let data = codec
        .encode(&DhtMessage::find_node_response(tid(b"r1"), &our_id, nodes.clone()))
        .unwrap();
    let decoded = codec.decode(&data).unwrap();

    let response = decoded.as_response().unwrap();
    assert_eq!(response.id(), &our_id);
    let ids: Vec<NodeId> = response.nodes().iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![nodes[0].id, nodes[1].id]);
    assert_eq!(response.nodes()[1].addr, nodes[1].addr);

    let empty = codec
        .encode(&DhtMessage::find_node_response(tid(b"r2"), &our_id, Vec::new()))
        .unwrap();
    assert!(matches!(
        codec.decode(&empty).unwrap().as_response(),
        Some(DhtResponse::FindNode { nodes, .. }) if nodes.is_empty()
    ));
}

#[test]
fn test_codec_errors_and_unknown_methods() {
    let codec = KrpcCodec::new();

    let data = codec
        .encode(&DhtMessage::error(tid(b"zz"), ERROR_GENERIC, "A Generic Error Ocurred"))
        .unwrap();
    assert_eq!(&data[..], b"d1:eli201e23:A Generic Error Ocurrede1:t2:zz1:y1:ee");
    assert!(matches!(
        codec.decode(&data).unwrap().kind,
        MessageKind::Error { code: 201, .. }
    ));

    let get_peers = b"d1:ad2:id20:abcdefghij01234567899:info_hash20:mnopqrstuvwxyz123456e1:q9:get_peers1:t2:aa1:y1:qe";
    let decoded = codec.decode(get_peers).unwrap();
    assert!(matches!(
        decoded.kind,
        MessageKind::Query(DhtQuery::Unsupported { ref method }) if method == "get_peers"
    ));

    assert!(codec.decode(b"i42e").is_err());
    assert!(codec.decode(b"d1:t2:aa1:y1:xe").is_err());
    assert!(codec.decode(b"d1:y1:qe").is_err());
    assert!(codec
        .decode(b"d1:ad2:id3:abce1:q4:ping1:t2:aa1:y1:qe")
        .is_err());
}

#[test]
fn test_codec_transaction_ids_are_distinct() {
    let mut codec = KrpcCodec::new();
    let ids: Vec<TransactionId> = (0..1000).map(|_| codec.next_transaction_id()).collect();
    assert!(ids.iter().all(|id| id.len() == 2));

    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
}

// ---------------------------------------------------------------------------
// Dispatcher, tasks and lookups over a simulated network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    sent: Vec<(Vec<u8>, SocketAddr)>,
}

impl DatagramSink for RecordingSink {
    fn send_datagram(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DhtError> {
        self.sent.push((data.to_vec(), addr));
        Ok(data.len())
    }
}

/// Remote nodes that answer FIND_NODE with the closest nodes they know, or
/// with a fixed node list when one is scripted for them.
struct SimulatedNetwork {
    nodes: HashMap<SocketAddr, NodeId>,
    all: Vec<Node>,
    scripted: HashMap<SocketAddr, Vec<Node>>,
}

impl SimulatedNetwork {
    fn new(count: u32) -> Self {
        let all: Vec<Node> = (0..count).map(|i| node(NodeId::generate(), i)).collect();
        let nodes = all
            .iter()
            .map(|n| (n.addr.to_socket_addr().unwrap(), n.id))
            .collect();
        Self {
            nodes,
            all,
            scripted: HashMap::new(),
        }
    }

    fn scripted(routes: Vec<(Node, Vec<Node>)>) -> Self {
        let mut network = Self::new(0);
        for (remote, known) in routes {
            let addr = remote.addr.to_socket_addr().unwrap();
            network.nodes.insert(addr, remote.id);
            network.scripted.insert(addr, known);
            network.all.push(remote);
        }
        network
    }

    fn answer(&self, codec: &KrpcCodec, data: &[u8], to: SocketAddr) -> Option<DhtMessage> {
        let id = *self.nodes.get(&to)?;
        let query = codec.decode(data).ok()?;
        let MessageKind::Query(DhtQuery::FindNode { target }) = query.kind else {
            return Some(DhtMessage::ping_response(query.transaction_id, &id));
        };
        if let Some(known) = self.scripted.get(&to) {
            return Some(DhtMessage::find_node_response(
                query.transaction_id,
                &id,
                known.clone(),
            ));
        }

        let mut known: Vec<Node> = self.all.iter().filter(|n| n.id != id).cloned().collect();
        known.sort_by_key(|n| n.id.distance(&target));
        known.truncate(8);
        Some(DhtMessage::find_node_response(query.transaction_id, &id, known))
    }
}

struct Harness {
    config: DhtConfig,
    table: RoutingTable,
    dispatcher: MessageDispatcher,
    tracker: MessageTracker,
    codec: KrpcCodec,
    tasks: TaskQueue,
    sink: RecordingSink,
}

impl Harness {
    fn new(local_id: NodeId) -> Self {
        let config = DhtConfig::default().with_bootstrap_nodes(Vec::<String>::new());
        Self {
            table: RoutingTable::from_config(local_id, &config),
            dispatcher: MessageDispatcher::new(local_id, config.message_timeout),
            tracker: MessageTracker::new(config.max_pending_queries),
            codec: KrpcCodec::new(),
            tasks: TaskQueue::from_config(&config),
            sink: RecordingSink::default(),
            config,
        }
    }

    fn turn(&mut self) {
        let mut ctx = TaskContext::new(&mut self.table, &mut self.dispatcher, &self.config);
        self.tasks.execute(&mut ctx);
        self.dispatcher.send_messages(
            &mut self.sink,
            &mut self.tracker,
            &mut self.codec,
            &mut self.table,
        );
    }

    /// Delivers replies to everything sent since the last call.
    fn deliver(&mut self, network: &SimulatedNetwork) -> usize {
        let sent = std::mem::take(&mut self.sink.sent);
        let mut delivered = 0;
        for (data, to) in sent {
            if let Some(reply) = network.answer(&self.codec, &data, to) {
                let sender = PeerAddr::from(to);
                if self.tracker.handle_response(&reply, &sender, &mut self.table) {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

#[test]
fn test_dispatcher_registers_and_fails_unsendable() {
    let mut h = Harness::new(NodeId::generate());
    let handler = Arc::new(CountingHandler::default());

    h.dispatcher
        .add_query(node(NodeId::generate(), 1), DhtQuery::Ping, handler.clone());
    h.dispatcher.add_query(
        Node::new(NodeId::generate(), PeerAddr::new("unresolved.example", 1)),
        DhtQuery::Ping,
        handler.clone(),
    );
    h.dispatcher.add_reply(
        addr(3),
        DhtMessage::ping_response(tid(b"rr"), h.dispatcher.local_id()),
    );
    assert_eq!(h.dispatcher.len(), 3);

    let sent = h.dispatcher.send_messages(
        &mut h.sink,
        &mut h.tracker,
        &mut h.codec,
        &mut h.table,
    );
    assert_eq!(sent, 2);
    assert!(h.dispatcher.is_empty());
    assert_eq!(h.tracker.len(), 1);
    assert_eq!(h.sink.sent.len(), 2);
    assert_eq!(handler.counts(), (0, 1));
}

struct CountingTask {
    runs: Arc<AtomicUsize>,
    turns_left: usize,
}

impl Task for CountingTask {
    fn startup(&mut self, _ctx: &mut TaskContext<'_>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&mut self, _ctx: &mut TaskContext<'_>) {
        self.turns_left = self.turns_left.saturating_sub(1);
    }

    fn is_finished(&self) -> bool {
        self.turns_left == 0
    }

    fn reset(&mut self) {
        self.turns_left = 1;
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[test]
fn test_task_queue_lanes() {
    let mut h = Harness::new(NodeId::generate());
    h.tasks = TaskQueue::new(2, 1);
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        h.tasks.add_immediate_task(Box::new(CountingTask {
            runs: runs.clone(),
            turns_left: 1,
        }));
    }
    h.tasks.add_periodic_task1(Box::new(CountingTask {
        runs: runs.clone(),
        turns_left: 1,
    }));
    assert_eq!(h.tasks.immediate_len(), 3);
    assert_eq!(h.tasks.periodic_len(), 1);

    h.turn();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(h.tasks.immediate_len(), 3);

    h.turn();
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(h.tasks.immediate_len(), 1);
    assert_eq!(h.tasks.periodic_len(), 0);

    h.turn();
    h.turn();
    assert!(h.tasks.is_idle());
}

#[test]
fn test_recurring_task_cadence_and_cancel() {
    let mut h = Harness::new(NodeId::generate());
    let runs = Arc::new(AtomicUsize::new(0));
    let handle = h.tasks.add_recurring_task(
        Box::new(CountingTask {
            runs: runs.clone(),
            turns_left: 0,
        }),
        Duration::from_secs(60),
    );

    let start = Instant::now();
    let exec = |h: &mut Harness, at: Instant| {
        let mut ctx = TaskContext::new(&mut h.table, &mut h.dispatcher, &h.config);
        h.tasks.execute_at(at, &mut ctx);
    };

    exec(&mut h, start);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    exec(&mut h, start + Duration::from_secs(1));
    exec(&mut h, start + Duration::from_secs(30));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    exec(&mut h, start + Duration::from_secs(61));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    assert_eq!(h.tasks.recurring_len(), 1);
    assert!(h.tasks.cancel(handle));
    assert!(!h.tasks.cancel(handle));
    exec(&mut h, start + Duration::from_secs(200));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_refresh_resets_staleness_before_lookup_completes() {
    let mut h = Harness::new(NodeId::MIN);
    h.table = RoutingTable::with_params(NodeId::MIN, 8, Duration::from_millis(50));
    for i in 0..20 {
        h.table.add_node(node(NodeId::generate(), i));
    }
    let buckets = h.table.bucket_count();

    std::thread::sleep(Duration::from_millis(60));
    assert!(h.table.buckets().iter().all(|b| b.needs_refresh()));

    h.tasks.add_recurring_task(Box::new(BucketRefreshTask::new()), Duration::from_secs(300));
    h.turn();

    assert!(h.table.buckets().iter().all(|b| !b.needs_refresh()));
    assert_eq!(h.tasks.periodic_len(), buckets);
    assert!(h.sink.sent.is_empty());

    // The spawned lookups start on the next turn, limited by lane concurrency.
    h.turn();
    assert!(!h.sink.sent.is_empty());
}

#[test]
fn test_forced_refresh_covers_fresh_buckets() {
    let mut h = Harness::new(NodeId::generate());
    for i in 0..30 {
        h.table.add_node(node(NodeId::generate(), i));
    }
    assert!(h.table.buckets().iter().all(|b| !b.needs_refresh()));

    h.tasks.add_immediate_task(Box::new(BucketRefreshTask::new()));
    h.turn();
    assert_eq!(h.tasks.periodic_len(), 0);

    h.tasks.add_immediate_task(Box::new(BucketRefreshTask::forced()));
    h.turn();
    assert_eq!(h.tasks.periodic_len(), h.table.bucket_count());
}

#[test]
fn test_lookup_converges_on_known_target() {
    let network = SimulatedNetwork::new(40);
    let mut h = Harness::new(NodeId::generate());
    for seed in network.all.iter().take(3) {
        h.table.add_node(seed.clone());
    }
    let target = network.all[17].id;

    let lookup = NodeLookupTask::new(target, &h.config);
    let handle = lookup.handle();
    h.tasks.add_immediate_task(Box::new(lookup));

    for _ in 0..50 {
        h.turn();
        h.deliver(&network);
        if handle.is_finished() {
            break;
        }
    }

    assert!(handle.is_finished());
    assert!(handle.rounds() <= h.config.max_lookup_rounds);
    let closest = handle.closest();
    assert_eq!(closest[0].id, target);
    assert!(closest[0].id.distance(&target).is_zero());
    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
    assert!(h.table.find_node(&target).is_some());
    assert!(h.table.node_count() > 3);
}

#[test]
fn test_lookup_survives_unresponsive_nodes() {
    let network = SimulatedNetwork::new(20);
    let mut h = Harness::new(NodeId::generate());
    let dead = node(NodeId::generate(), 500);
    h.table.add_node(dead.clone());
    h.table.add_node(network.all[0].clone());
    let target = network.all[5].id;

    let lookup = NodeLookupTask::new(target, &h.config);
    let handle = lookup.handle();
    h.tasks.add_immediate_task(Box::new(lookup));

    h.turn();
    h.deliver(&network);
    assert_eq!(h.tracker.len(), 1);

    let later = Instant::now() + h.config.message_timeout;
    assert_eq!(h.tracker.sweep_timeouts_at(later, &mut h.table), 1);
    assert_eq!(h.table.find_node(&dead.id).unwrap().failures, 1);

    for _ in 0..50 {
        h.turn();
        h.deliver(&network);
        if handle.is_finished() {
            break;
        }
    }

    assert!(handle.is_finished());
    assert_eq!(handle.closest()[0].id, target);
    assert!(handle.closest().iter().all(|n| n.id != dead.id));
}

#[test]
fn test_lookup_continues_past_timed_out_closest_node() {
    let target = NodeId::generate();
    let flip = |bit: usize| target.with_bit(bit, !target.bit(bit));

    let dead = node(flip(159), 100);
    let learned = node(flip(40), 101);
    let seed = node(flip(0), 102);
    let found = node(target, 103);
    let network = SimulatedNetwork::scripted(vec![
        (seed.clone(), vec![learned.clone()]),
        (learned.clone(), vec![found.clone()]),
        (found.clone(), Vec::new()),
    ]);

    let mut h = Harness::new(NodeId::generate());
    h.table.add_node(seed.clone());
    h.table.add_node(dead.clone());

    let lookup = NodeLookupTask::new(target, &h.config);
    let handle = lookup.handle();
    h.tasks.add_immediate_task(Box::new(lookup));

    // The seed answers with a node farther away than the dead one.
    h.turn();
    assert_eq!(h.deliver(&network), 1);
    let later = Instant::now() + h.config.message_timeout;
    assert_eq!(h.tracker.sweep_timeouts_at(later, &mut h.table), 1);

    h.turn();
    assert!(!handle.is_finished());
    let learned_addr = learned.addr.to_socket_addr().unwrap();
    assert!(h.sink.sent.iter().any(|(_, to)| *to == learned_addr));

    for _ in 0..20 {
        h.deliver(&network);
        h.turn();
        if handle.is_finished() {
            break;
        }
    }

    assert!(handle.is_finished());
    assert!(handle.rounds() >= 3);
    let closest = handle.closest();
    assert_eq!(closest[0].id, target);
    assert!(closest.iter().all(|n| n.id != dead.id));
    assert!(h.table.find_node(&target).is_some());
}

#[test]
fn test_lookup_on_empty_table_finishes() {
    let mut h = Harness::new(NodeId::generate());
    let lookup = NodeLookupTask::new(NodeId::generate(), &h.config);
    let handle = lookup.handle();
    h.tasks.add_immediate_task(Box::new(lookup));

    h.turn();
    assert!(handle.is_finished());
    assert_eq!(handle.rounds(), 0);
    assert!(handle.closest().is_empty());
    assert!(h.tasks.is_idle());
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_persist_layout() {
    let local = NodeId([7u8; 20]);
    let nodes = vec![
        Node::new(NodeId([1u8; 20]), PeerAddr::new("192.168.0.1", 6881)),
        Node::new(NodeId([2u8; 20]), PeerAddr::new("::1", 6882)),
    ];

    let mut data = Vec::new();
    persist::serialize_at(
        &mut data,
        &local,
        &nodes,
        std::time::UNIX_EPOCH + Duration::from_secs(0x0102_0304),
    )
    .unwrap();

    assert_eq!(data.len(), 8 + 8 + 32 + 8 + 2 * 56);
    assert_eq!(&data[..8], &[0xa1, 0xa2, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    assert_eq!(&data[8..16], &[0, 0, 0, 0, 1, 2, 3, 4]);
    assert_eq!(&data[24..44], &[7u8; 20]);
    assert_eq!(&data[48..52], &[0, 0, 0, 2]);

    let first = &data[56..112];
    assert_eq!(first[0], 6);
    assert_eq!(&first[8..14], &[192, 168, 0, 1, 0x1A, 0xE1]);
    assert_eq!(&first[32..52], &[1u8; 20]);
    assert_eq!(data[112], 18);

    let saved = persist::deserialize(&mut data.as_slice()).unwrap();
    assert_eq!(saved.local_id, local);
    assert_eq!(saved.nodes.len(), 2);
    assert_eq!(saved.nodes[1].addr, PeerAddr::new("::1", 6882));
}

#[test]
fn test_persist_rejects_bad_input() {
    let local = NodeId::generate();
    let mut data = Vec::new();
    persist::serialize(&mut data, &local, &[node(NodeId::generate(), 1)]).unwrap();

    let mut bad_magic = data.clone();
    bad_magic[0] = 0;
    assert!(matches!(
        persist::deserialize(&mut bad_magic.as_slice()),
        Err(DhtError::Persistence(_))
    ));

    let mut bad_version = data.clone();
    bad_version[7] = 3;
    assert!(matches!(
        persist::deserialize(&mut bad_version.as_slice()),
        Err(DhtError::Persistence(_))
    ));

    let truncated = &data[..data.len() - 10];
    assert!(matches!(
        persist::deserialize(&mut &truncated[..]),
        Err(DhtError::Persistence(_))
    ));

    assert!(persist::deserialize(&mut &data[..20]).is_err());
}

#[test]
fn test_persist_drops_malformed_records() {
    let local = NodeId::generate();
    let good = node(NodeId::generate(), 1);
    let mut data = Vec::new();
    persist::serialize(&mut data, &local, &[good.clone(), good.clone()]).unwrap();

    // Corrupt the second record's compact length.
    data[56 + 56] = 9;

    let saved = persist::deserialize(&mut data.as_slice()).unwrap();
    assert_eq!(saved.nodes.len(), 1);
    assert_eq!(saved.nodes[0].addr, good.addr);
}

// ---------------------------------------------------------------------------
// Server event loop
// ---------------------------------------------------------------------------

fn loopback_server(config: DhtConfig) -> DhtServer {
    DhtServer::bind(
        config
            .with_port(0)
            .with_bootstrap_nodes(Vec::<String>::new()),
    )
    .unwrap()
}

#[test]
fn test_receive_errors_are_skipped() {
    let mut server = loopback_server(DhtConfig::default());

    for kind in [
        std::io::ErrorKind::ConnectionRefused,
        std::io::ErrorKind::ConnectionReset,
        std::io::ErrorKind::Interrupted,
    ] {
        let error = TransportError::io("recvfrom")(std::io::Error::from(kind));
        assert!(server.accept_datagram(Err(error)));
    }

    let drained = TransportError::io("recvfrom")(std::io::Error::from(
        std::io::ErrorKind::WouldBlock,
    ));
    assert!(!server.accept_datagram(Err(drained)));

    server.step(Duration::from_millis(1)).unwrap();
    assert_eq!(server.routing_table().node_count(), 0);
}

#[test]
fn test_run_flushes_table_when_a_step_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dht.dat");
    let mut server = loopback_server(DhtConfig::default().with_routing_table_path(&path));

    // A closed socket makes the next step fail.
    server.shutdown().unwrap();
    std::fs::remove_file(&path).unwrap();

    let stop = std::sync::atomic::AtomicBool::new(false);
    assert!(matches!(
        server.run(&stop),
        Err(DhtError::Transport(TransportError::NotConnected))
    ));
    assert!(path.exists());
}

#[test]
fn test_run_stops_when_flag_is_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dht.dat");
    let mut server = loopback_server(DhtConfig::default().with_routing_table_path(&path));

    let stop = std::sync::atomic::AtomicBool::new(true);
    server.run(&stop).unwrap();
    assert!(path.exists());
}
