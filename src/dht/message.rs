use super::error::DhtError;
use super::node::{Node, NodeId, COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN};
use crate::bencode::{decode, encode, DictBuilder, Value};
use bytes::Bytes;

pub type TransactionId = Bytes;

/// KRPC error codes (BEP-5).
pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// Query methods this overlay issues and answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    FindNode,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::FindNode => "find_node",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtQuery {
    Ping,
    FindNode { target: NodeId },
    /// A well-formed query for a method this node does not implement.
    Unsupported { method: String },
}

impl DhtQuery {
    pub fn method(&self) -> &str {
        match self {
            DhtQuery::Ping => MessageType::Ping.as_str(),
            DhtQuery::FindNode { .. } => MessageType::FindNode.as_str(),
            DhtQuery::Unsupported { method } => method,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            DhtQuery::Ping => Some(MessageType::Ping),
            DhtQuery::FindNode { .. } => Some(MessageType::FindNode),
            DhtQuery::Unsupported { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DhtResponse {
    Ping { id: NodeId },
    FindNode { id: NodeId, nodes: Vec<Node> },
}

impl DhtResponse {
    pub fn id(&self) -> &NodeId {
        match self {
            DhtResponse::Ping { id } | DhtResponse::FindNode { id, .. } => id,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        match self {
            DhtResponse::Ping { .. } => &[],
            DhtResponse::FindNode { nodes, .. } => nodes,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MessageKind {
    Query(DhtQuery),
    Response(DhtResponse),
    Error { code: i64, message: String },
}

#[derive(Debug, Clone)]
pub struct DhtMessage {
    pub transaction_id: TransactionId,
    /// Id the sender reported. Error replies carry none.
    pub sender_id: Option<NodeId>,
    pub kind: MessageKind,
}

impl DhtMessage {
    pub fn query(transaction_id: TransactionId, our_id: &NodeId, query: DhtQuery) -> Self {
        Self {
            transaction_id,
            sender_id: Some(*our_id),
            kind: MessageKind::Query(query),
        }
    }

    pub fn ping(transaction_id: TransactionId, our_id: &NodeId) -> Self {
        Self::query(transaction_id, our_id, DhtQuery::Ping)
    }

    pub fn find_node(transaction_id: TransactionId, our_id: &NodeId, target: NodeId) -> Self {
        Self::query(transaction_id, our_id, DhtQuery::FindNode { target })
    }

    pub fn response(transaction_id: TransactionId, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            sender_id: Some(*response.id()),
            kind: MessageKind::Response(response),
        }
    }

    pub fn ping_response(transaction_id: TransactionId, our_id: &NodeId) -> Self {
        Self::response(transaction_id, DhtResponse::Ping { id: *our_id })
    }

    pub fn find_node_response(
        transaction_id: TransactionId,
        our_id: &NodeId,
        nodes: Vec<Node>,
    ) -> Self {
        Self::response(
            transaction_id,
            DhtResponse::FindNode {
                id: *our_id,
                nodes,
            },
        )
    }

    pub fn error(transaction_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            sender_id: None,
            kind: MessageKind::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self.kind, MessageKind::Query(_))
    }

    pub fn as_response(&self) -> Option<&DhtResponse> {
        match &self.kind {
            MessageKind::Response(response) => Some(response),
            _ => None,
        }
    }
}

/// Wire encoding of DHT messages.
pub trait MessageCodec: Send {
    fn encode(&self, message: &DhtMessage) -> Result<Vec<u8>, DhtError>;

    fn decode(&self, data: &[u8]) -> Result<DhtMessage, DhtError>;

    /// A transaction id not handed out recently.
    fn next_transaction_id(&mut self) -> TransactionId;
}

/// KRPC over bencode, as spoken by BitTorrent DHT nodes.
///
/// Transaction ids are two-byte counters starting at a random value, so ids
/// repeat only after 65536 queries.
#[derive(Debug)]
pub struct KrpcCodec {
    next_transaction: u16,
}

impl KrpcCodec {
    pub fn new() -> Self {
        Self {
            next_transaction: rand::random(),
        }
    }
}

impl Default for KrpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec for KrpcCodec {
    fn encode(&self, message: &DhtMessage) -> Result<Vec<u8>, DhtError> {
        let dict = DictBuilder::new().insert("t", message.transaction_id.clone());

        let dict = match &message.kind {
            MessageKind::Query(query) => {
                let sender = message
                    .sender_id
                    .ok_or_else(|| DhtError::InvalidMessage("query without sender id".into()))?;

                let args = DictBuilder::new().insert("id", Value::bytes(sender.as_bytes()));
                let args = match query {
                    DhtQuery::FindNode { target } => {
                        args.insert("target", Value::bytes(target.as_bytes()))
                    }
                    DhtQuery::Ping | DhtQuery::Unsupported { .. } => args,
                };

                dict.insert("y", "q")
                    .insert("q", query.method())
                    .insert("a", args.build())
            }
            MessageKind::Response(response) => {
                let resp = DictBuilder::new().insert("id", Value::bytes(response.id().as_bytes()));
                let resp = match response {
                    DhtResponse::Ping { .. } => resp,
                    DhtResponse::FindNode { nodes, .. } => {
                        let (v4, v6) = compact_nodes(nodes);
                        resp.insert("nodes", Value::Bytes(v4))
                            .insert_if(!v6.is_empty(), "nodes6", Value::Bytes(v6))
                    }
                };

                dict.insert("y", "r").insert("r", resp.build())
            }
            MessageKind::Error { code, message } => dict.insert("y", "e").insert(
                "e",
                vec![Value::Integer(*code), Value::string(message)],
            ),
        };

        Ok(encode(&dict.build()))
    }

    fn decode(&self, data: &[u8]) -> Result<DhtMessage, DhtError> {
        let value = decode(data)?;
        if value.as_dict().is_none() {
            return Err(DhtError::InvalidMessage("expected dict".into()));
        }

        let transaction_id = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .cloned()
            .ok_or_else(|| DhtError::InvalidMessage("missing transaction id".into()))?;

        let msg_type = value
            .get(b"y")
            .and_then(Value::as_str)
            .ok_or_else(|| DhtError::InvalidMessage("missing message type".into()))?;

        match msg_type {
            "q" => parse_query(transaction_id, &value),
            "r" => parse_response(transaction_id, &value),
            "e" => parse_error(transaction_id, &value),
            _ => Err(DhtError::InvalidMessage(format!(
                "unknown message type: {}",
                msg_type
            ))),
        }
    }

    fn next_transaction_id(&mut self) -> TransactionId {
        let id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        Bytes::copy_from_slice(&id.to_be_bytes())
    }
}

fn node_id_field(dict: &Value, key: &[u8]) -> Option<NodeId> {
    dict.get(key)
        .and_then(Value::as_bytes)
        .and_then(|b| NodeId::from_bytes(b).ok())
}

fn parse_query(transaction_id: TransactionId, value: &Value) -> Result<DhtMessage, DhtError> {
    let method = value
        .get(b"q")
        .and_then(Value::as_str)
        .ok_or_else(|| DhtError::InvalidMessage("missing query name".into()))?;

    let args = value
        .get(b"a")
        .filter(|a| a.as_dict().is_some())
        .ok_or_else(|| DhtError::InvalidMessage("missing query args".into()))?;

    let sender_id = node_id_field(args, b"id")
        .ok_or_else(|| DhtError::InvalidMessage("missing id in query".into()))?;

    let query = match method {
        "ping" => DhtQuery::Ping,
        "find_node" => {
            let target = node_id_field(args, b"target")
                .ok_or_else(|| DhtError::InvalidMessage("missing target".into()))?;
            DhtQuery::FindNode { target }
        }
        other => DhtQuery::Unsupported {
            method: other.to_string(),
        },
    };

    Ok(DhtMessage {
        transaction_id,
        sender_id: Some(sender_id),
        kind: MessageKind::Query(query),
    })
}

fn parse_response(transaction_id: TransactionId, value: &Value) -> Result<DhtMessage, DhtError> {
    let resp = value
        .get(b"r")
        .filter(|r| r.as_dict().is_some())
        .ok_or_else(|| DhtError::InvalidMessage("missing response dict".into()))?;

    let id = node_id_field(resp, b"id")
        .ok_or_else(|| DhtError::InvalidMessage("missing id in response".into()))?;

    let v4 = resp.get(b"nodes").and_then(Value::as_bytes);
    let v6 = resp.get(b"nodes6").and_then(Value::as_bytes);

    let response = if v4.is_some() || v6.is_some() {
        let mut nodes = Vec::new();
        if let Some(data) = v4 {
            nodes.extend(data.chunks_exact(COMPACT_NODE_V4_LEN).filter_map(Node::from_compact));
        }
        if let Some(data) = v6 {
            nodes.extend(data.chunks_exact(COMPACT_NODE_V6_LEN).filter_map(Node::from_compact));
        }
        DhtResponse::FindNode { id, nodes }
    } else {
        DhtResponse::Ping { id }
    };

    Ok(DhtMessage {
        transaction_id,
        sender_id: Some(id),
        kind: MessageKind::Response(response),
    })
}

fn parse_error(transaction_id: TransactionId, value: &Value) -> Result<DhtMessage, DhtError> {
    let error = value
        .get(b"e")
        .and_then(Value::as_list)
        .ok_or_else(|| DhtError::InvalidMessage("missing error list".into()))?;

    let code = error
        .first()
        .and_then(Value::as_integer)
        .unwrap_or(ERROR_GENERIC);

    let message = error
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or("unknown error");

    Ok(DhtMessage::error(transaction_id, code, message))
}

/// Packs nodes into the `nodes` (IPv4) and `nodes6` (IPv6) compact strings.
fn compact_nodes(nodes: &[Node]) -> (Bytes, Bytes) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for compact in nodes.iter().filter_map(Node::to_compact) {
        if compact.len() == COMPACT_NODE_V4_LEN {
            v4.extend_from_slice(&compact);
        } else {
            v6.extend_from_slice(&compact);
        }
    }
    (Bytes::from(v4), Bytes::from(v6))
}
