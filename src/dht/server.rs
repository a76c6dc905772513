use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::dispatcher::MessageDispatcher;
use super::error::DhtError;
use super::lookup::{LookupHandle, NodeLookupTask};
use super::message::{
    DhtMessage, DhtQuery, KrpcCodec, MessageCodec, MessageKind, ERROR_METHOD_UNKNOWN,
};
use super::node::{Node, NodeId};
use super::persist;
use super::refresh::BucketRefreshTask;
use super::routing::RoutingTable;
use super::task::{TaskContext, TaskHandle, TaskQueue};
use super::tracker::{MessageTracker, ResponseHandler};
use crate::config::DhtConfig;
use crate::constants::{MAX_DATAGRAMS_PER_STEP, MAX_DATAGRAM_SIZE};
use crate::socket::{PeerAddr, TransportError, TransportSocket};

/// Poll timeout used by [`DhtServer::run`] between stop checks.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Adds whoever answers a ping to the routing table.
struct PingResponder {
    /// False for bootstrap routers whose id is not known in advance.
    known_id: bool,
}

impl ResponseHandler for PingResponder {
    fn on_response(&self, target: &Node, response: &DhtMessage, table: &mut RoutingTable) {
        if let Some(id) = response.sender_id {
            debug!("Ping answered by {} ({})", target.addr, id);
            table.add_node(Node::new(id, target.addr.clone()));
        }
    }

    fn on_failure(&self, target: &Node, error: &DhtError, table: &mut RoutingTable) {
        debug!("Ping to {} failed: {}", target.addr, error);
        if self.known_id && matches!(error, DhtError::Timeout) {
            table.mark_failed(&target.id);
        }
    }
}

/// A DHT node bound to one UDP port.
///
/// `DhtServer` owns the routing table, tracker, dispatcher and task queue and
/// drives them from [`step`](Self::step). Nothing runs in the background:
/// call `step` in a loop, or hand the thread to [`run`](Self::run).
///
/// # Examples
///
/// ```no_run
/// use rdht::config::DhtConfig;
/// use rdht::dht::DhtServer;
/// use std::sync::atomic::AtomicBool;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = DhtConfig::default().with_routing_table_path("dht.dat");
/// let mut dht = DhtServer::bind(config)?;
/// dht.bootstrap();
///
/// let stop = AtomicBool::new(false);
/// dht.run(&stop)?;
/// # Ok(())
/// # }
/// ```
pub struct DhtServer {
    config: DhtConfig,
    socket: TransportSocket,
    port: u16,
    local_id: NodeId,
    table: RoutingTable,
    tracker: MessageTracker,
    dispatcher: MessageDispatcher,
    tasks: TaskQueue,
    codec: KrpcCodec,
    refresh_task: Option<TaskHandle>,
    bootstrap_pending: bool,
    last_save: Instant,
    recv_buf: Vec<u8>,
}

impl DhtServer {
    /// Binds the UDP socket, restoring the routing table from the configured
    /// file when one exists.
    pub fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        config.validate()?;

        let saved = match &config.routing_table_path {
            Some(path) if path.exists() => match persist::load_from_file(path) {
                Ok(saved) => Some(saved),
                Err(e) => {
                    warn!("Ignoring routing table {}: {}", path.display(), e);
                    None
                }
            },
            _ => None,
        };

        let local_id = saved.as_ref().map_or_else(NodeId::generate, |s| s.local_id);
        let mut server = Self::bind_with_id(config, local_id)?;

        if let Some(saved) = saved {
            let mut restored = 0;
            for node in saved.nodes {
                if server.table.add_node(node) {
                    restored += 1;
                }
            }
            info!("Restored {} DHT nodes", restored);
        }

        Ok(server)
    }

    /// Binds with a fixed local id and an empty routing table.
    pub fn bind_with_id(config: DhtConfig, local_id: NodeId) -> Result<Self, DhtError> {
        config.validate()?;

        let mut socket = TransportSocket::datagram();
        socket.bind(config.port)?;
        socket.set_non_blocking_mode()?;
        let port = socket.local_addr()?.port;

        info!("DHT server bound to port {} with id {}", port, local_id);

        let mut tasks = TaskQueue::from_config(&config);
        let refresh_task = tasks.add_recurring_task(
            Box::new(BucketRefreshTask::new()),
            config.refresh_check_interval,
        );

        Ok(Self {
            table: RoutingTable::from_config(local_id, &config),
            tracker: MessageTracker::new(config.max_pending_queries),
            dispatcher: MessageDispatcher::new(local_id, config.message_timeout),
            tasks,
            codec: KrpcCodec::new(),
            refresh_task: Some(refresh_task),
            bootstrap_pending: false,
            last_save: Instant::now(),
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            socket,
            port,
            local_id,
            config,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable {
        &mut self.table
    }

    pub fn pending_queries(&self) -> usize {
        self.tracker.len()
    }

    pub fn task_queue(&self) -> &TaskQueue {
        &self.tasks
    }

    /// Pings every configured bootstrap node. Once one answers, a lookup of
    /// the local id and a forced refresh of every bucket are scheduled.
    pub fn bootstrap(&mut self) -> usize {
        info!("Starting DHT bootstrap");

        let mut pinged = 0;
        for entry in self.config.bootstrap_nodes.clone() {
            match resolve_bootstrap(&entry) {
                Some(addr) => {
                    debug!("Pinging bootstrap node {} ({})", entry, addr);
                    self.ping(PeerAddr::from(addr));
                    pinged += 1;
                }
                None => warn!("Failed to resolve bootstrap node {}", entry),
            }
        }

        self.bootstrap_pending = pinged > 0 || self.table.node_count() > 0;
        pinged
    }

    /// Pings a node whose id is not known yet.
    pub fn ping(&mut self, addr: PeerAddr) {
        let target = Node::new(NodeId::MIN, addr);
        self.dispatcher
            .add_query(target, DhtQuery::Ping, Arc::new(PingResponder { known_id: false }));
    }

    /// Pings a node already in the routing table.
    pub fn ping_node(&mut self, node: Node) {
        self.dispatcher
            .add_query(node, DhtQuery::Ping, Arc::new(PingResponder { known_id: true }));
    }

    /// Starts an iterative lookup of `target`.
    pub fn find_node(&mut self, target: NodeId) -> LookupHandle {
        let task = NodeLookupTask::new(target, &self.config);
        let handle = task.handle();
        self.tasks.add_immediate_task(Box::new(task));
        handle
    }

    /// One pass of the event loop, waiting at most `timeout` for a datagram.
    pub fn step(&mut self, timeout: Duration) -> Result<(), DhtError> {
        if self.socket.is_readable(timeout)? {
            self.drain_socket()?;
        }

        self.tracker.sweep_timeouts(&mut self.table);
        self.schedule_bootstrap_lookup();

        let mut ctx = TaskContext::new(&mut self.table, &mut self.dispatcher, &self.config);
        self.tasks.execute(&mut ctx);

        self.dispatcher.send_messages(
            &mut self.socket,
            &mut self.tracker,
            &mut self.codec,
            &mut self.table,
        );

        if self.last_save.elapsed() >= self.config.save_interval {
            if let Err(e) = self.save_routing_table() {
                warn!("Failed to save DHT routing table: {}", e);
            }
        }

        Ok(())
    }

    /// Steps until `stop` is set or a step fails, then shuts down.
    ///
    /// The shutdown flush runs on both paths; a step error takes precedence
    /// over a shutdown error in the result.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), DhtError> {
        let mut stepped = Ok(());
        while stepped.is_ok() && !stop.load(Ordering::Relaxed) {
            stepped = self.step(RUN_POLL_INTERVAL);
        }
        if let Err(e) = &stepped {
            warn!("DHT event loop on port {} failed: {}", self.port, e);
        }
        let shut = self.shutdown();
        stepped.and(shut)
    }

    /// Cancels every task, flushes the routing table and closes the socket.
    pub fn shutdown(&mut self) -> Result<(), DhtError> {
        if let Some(handle) = self.refresh_task.take() {
            self.tasks.cancel(handle);
        }
        self.tasks.cancel_all();
        let saved = self.save_routing_table();
        self.socket.close_connection();
        info!("DHT server on port {} shut down", self.port);
        saved.map(|_| ())
    }

    /// Writes the table to the configured path. Returns `false` when no path
    /// is configured.
    pub fn save_routing_table(&mut self) -> Result<bool, DhtError> {
        self.last_save = Instant::now();
        let Some(path) = &self.config.routing_table_path else {
            return Ok(false);
        };
        persist::save_to_file(path, &self.local_id, &self.table.all_nodes())?;
        Ok(true)
    }

    fn drain_socket(&mut self) -> Result<(), DhtError> {
        for _ in 0..MAX_DATAGRAMS_PER_STEP {
            let received = self.socket.read_data_from(&mut self.recv_buf);
            if !self.accept_datagram(received) {
                break;
            }
            if !self.socket.is_readable(Duration::ZERO)? {
                break;
            }
        }
        Ok(())
    }

    /// Handles one receive attempt. Returns false once the socket has no
    /// datagram left.
    ///
    /// Per-datagram failures such as ICMP-induced `ECONNREFUSED` or
    /// `ECONNRESET` are logged and skipped.
    pub(super) fn accept_datagram(
        &mut self,
        received: Result<(usize, PeerAddr), TransportError>,
    ) -> bool {
        let (len, sender) = match received {
            Ok(received) => received,
            Err(e) if e.is_would_block() => return false,
            Err(e) => {
                debug!("Skipping failed DHT receive on port {}: {}", self.port, e);
                return true;
            }
        };

        match self.codec.decode(&self.recv_buf[..len]) {
            Ok(message) => self.handle_message(message, sender),
            Err(e) => debug!("Failed to parse DHT message from {}: {}", sender, e),
        }
        true
    }

    fn handle_message(&mut self, message: DhtMessage, sender: PeerAddr) {
        let MessageKind::Query(query) = &message.kind else {
            if !self
                .tracker
                .handle_response(&message, &sender, &mut self.table)
            {
                debug!("Unsolicited DHT reply from {}", sender);
            }
            return;
        };

        if let Some(id) = message.sender_id {
            self.table.add_node(Node::new(id, sender.clone()));
        }

        let tid = message.transaction_id.clone();
        let reply = match query {
            DhtQuery::Ping => DhtMessage::ping_response(tid, &self.local_id),
            DhtQuery::FindNode { target } => {
                let nodes = self.table.closest_nodes_mut(target, self.config.bucket_size);
                DhtMessage::find_node_response(tid, &self.local_id, nodes)
            }
            DhtQuery::Unsupported { method } => {
                debug!("Unsupported DHT query {} from {}", method, sender);
                DhtMessage::error(tid, ERROR_METHOD_UNKNOWN, "Method Unknown")
            }
        };
        self.dispatcher.add_reply(sender, reply);
    }

    fn schedule_bootstrap_lookup(&mut self) {
        if !self.bootstrap_pending || self.table.node_count() == 0 {
            return;
        }
        self.bootstrap_pending = false;

        info!(
            "DHT bootstrap reached {} nodes, looking up own id",
            self.table.node_count()
        );
        let lookup = NodeLookupTask::new(self.local_id, &self.config);
        self.tasks.add_immediate_task(Box::new(lookup));
        self.tasks.add_immediate_task(Box::new(BucketRefreshTask::forced()));
    }
}

fn resolve_bootstrap(entry: &str) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = entry.to_socket_addrs().ok()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}
