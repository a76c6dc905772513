use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::error::DhtError;
use super::message::{DhtMessage, DhtQuery, MessageCodec};
use super::node::{Node, NodeId};
use super::routing::RoutingTable;
use super::tracker::{MessageTracker, ResponseHandler};
use crate::socket::{PeerAddr, TransportSocket};

/// Destination for encoded datagrams.
pub trait DatagramSink {
    fn send_datagram(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DhtError>;
}

impl DatagramSink for TransportSocket {
    fn send_datagram(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, DhtError> {
        Ok(self.send_datagram_to(data, addr)?)
    }
}

enum Outgoing {
    Query {
        target: Node,
        query: DhtQuery,
        timeout: Duration,
        handler: Arc<dyn ResponseHandler>,
    },
    Reply {
        addr: PeerAddr,
        message: DhtMessage,
    },
}

/// Queue of messages waiting to go out.
///
/// Tasks queue queries here; [`send_messages`](Self::send_messages) encodes
/// them with a fresh transaction id, sends them and registers each with the
/// tracker. A query that cannot be sent is failed through its handler right
/// away.
pub struct MessageDispatcher {
    local_id: NodeId,
    default_timeout: Duration,
    queue: VecDeque<Outgoing>,
}

impl MessageDispatcher {
    pub fn new(local_id: NodeId, default_timeout: Duration) -> Self {
        Self {
            local_id,
            default_timeout,
            queue: VecDeque::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn add_query(&mut self, target: Node, query: DhtQuery, handler: Arc<dyn ResponseHandler>) {
        let timeout = self.default_timeout;
        self.add_query_with_timeout(target, query, timeout, handler);
    }

    pub fn add_query_with_timeout(
        &mut self,
        target: Node,
        query: DhtQuery,
        timeout: Duration,
        handler: Arc<dyn ResponseHandler>,
    ) {
        self.queue.push_back(Outgoing::Query {
            target,
            query,
            timeout,
            handler,
        });
    }

    pub fn add_reply(&mut self, addr: PeerAddr, message: DhtMessage) {
        self.queue.push_back(Outgoing::Reply { addr, message });
    }

    /// Sends everything queued. Returns the number of datagrams sent.
    pub fn send_messages(
        &mut self,
        sink: &mut dyn DatagramSink,
        tracker: &mut MessageTracker,
        codec: &mut dyn MessageCodec,
        table: &mut RoutingTable,
    ) -> usize {
        let mut sent = 0;

        while let Some(outgoing) = self.queue.pop_front() {
            match outgoing {
                Outgoing::Query {
                    target,
                    query,
                    timeout,
                    handler,
                } => {
                    let result =
                        self.send_query(sink, tracker, codec, &target, query, timeout, &handler);
                    match result {
                        Ok(()) => sent += 1,
                        Err(e) => {
                            debug!("Query to {} not sent: {}", target.addr, e);
                            handler.on_failure(&target, &e, table);
                        }
                    }
                }
                Outgoing::Reply { addr, message } => {
                    match send_encoded(sink, codec, &addr, &message) {
                        Ok(()) => sent += 1,
                        Err(e) => debug!("Reply to {} not sent: {}", addr, e),
                    }
                }
            }
        }

        sent
    }

    #[allow(clippy::too_many_arguments)]
    fn send_query(
        &self,
        sink: &mut dyn DatagramSink,
        tracker: &mut MessageTracker,
        codec: &mut dyn MessageCodec,
        target: &Node,
        query: DhtQuery,
        timeout: Duration,
        handler: &Arc<dyn ResponseHandler>,
    ) -> Result<(), DhtError> {
        let message_type = query
            .message_type()
            .ok_or_else(|| DhtError::InvalidMessage(format!("cannot send {}", query.method())))?;
        if tracker.is_full() {
            return Err(DhtError::RateLimited);
        }

        let transaction_id = codec.next_transaction_id();
        let message = DhtMessage::query(transaction_id.clone(), &self.local_id, query);
        send_encoded(sink, codec, &target.addr, &message)?;

        tracker.add_entry(
            target.clone(),
            transaction_id,
            message_type,
            timeout,
            Arc::clone(handler),
        )
    }
}

fn send_encoded(
    sink: &mut dyn DatagramSink,
    codec: &mut dyn MessageCodec,
    addr: &PeerAddr,
    message: &DhtMessage,
) -> Result<(), DhtError> {
    let socket_addr = addr
        .to_socket_addr()
        .ok_or_else(|| DhtError::InvalidMessage(format!("non-numeric destination {}", addr)))?;
    let data = codec.encode(message)?;
    sink.send_datagram(&data, socket_addr)?;
    trace!("Sent {} byte datagram to {}", data.len(), addr);
    Ok(())
}
