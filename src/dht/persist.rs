//! Routing table file format.
//!
//! All integers are big-endian.
//!
//! ```text
//! header  : a1 a2 02 00 00 00 00 02
//! time    : u64 seconds since the UNIX epoch
//! local   : 8 reserved, 20 byte id, 4 reserved
//! count   : u32 node count, 4 reserved
//! node*   : u8 compact address length, 7 reserved,
//!           24 byte compact address (ip, port, zero padded),
//!           20 byte id, 4 reserved
//! ```
//!
//! A node whose host is not a numeric address is written with a compact
//! length of zero and skipped when the file is read back.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info};

use super::error::DhtError;
use super::node::{compact_addr, parse_compact_addr, Node, NodeId};
use crate::constants::NODE_ID_LEN;

const HEADER: [u8; 8] = [0xa1, 0xa2, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
const COMPACT_AREA_LEN: usize = 24;
const NODE_RECORD_LEN: usize = 1 + 7 + COMPACT_AREA_LEN + NODE_ID_LEN + 4;

/// Contents of a routing table file.
#[derive(Debug, Clone)]
pub struct SavedRoutingTable {
    pub local_id: NodeId,
    pub serialized_at: SystemTime,
    pub nodes: Vec<Node>,
}

pub fn serialize<W: Write>(writer: &mut W, local_id: &NodeId, nodes: &[Node]) -> Result<(), DhtError> {
    serialize_at(writer, local_id, nodes, SystemTime::now())
}

pub fn serialize_at<W: Write>(
    writer: &mut W,
    local_id: &NodeId,
    nodes: &[Node],
    time: SystemTime,
) -> Result<(), DhtError> {
    let count = u32::try_from(nodes.len())
        .map_err(|_| DhtError::Persistence(format!("too many nodes: {}", nodes.len())))?;
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

    let mut buf = BytesMut::with_capacity(HEADER.len() + 48 + nodes.len() * NODE_RECORD_LEN);
    buf.put_slice(&HEADER);
    buf.put_u64(secs);

    buf.put_bytes(0, 8);
    buf.put_slice(local_id.as_bytes());
    buf.put_bytes(0, 4);

    buf.put_u32(count);
    buf.put_bytes(0, 4);

    for node in nodes {
        match compact_addr(&node.addr) {
            Some(compact) => {
                buf.put_u8(compact.len() as u8);
                buf.put_bytes(0, 7);
                buf.put_slice(&compact);
                buf.put_bytes(0, COMPACT_AREA_LEN - compact.len());
            }
            None => {
                buf.put_u8(0);
                buf.put_bytes(0, 7 + COMPACT_AREA_LEN);
            }
        }
        buf.put_slice(node.id.as_bytes());
        buf.put_bytes(0, 4);
    }

    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

pub fn deserialize<R: Read>(reader: &mut R) -> Result<SavedRoutingTable, DhtError> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    let mut buf = data.as_slice();

    take(&mut buf, HEADER.len(), "header").and_then(|header| {
        if header[..2] != HEADER[..2] {
            return Err(DhtError::Persistence("bad magic".into()));
        }
        if header != HEADER {
            return Err(DhtError::Persistence(format!(
                "unsupported format or version {:02x?}",
                &header[2..]
            )));
        }
        Ok(())
    })?;

    ensure(&buf, 8, "timestamp")?;
    let serialized_at = UNIX_EPOCH + Duration::from_secs(buf.get_u64());

    ensure(&buf, 8 + NODE_ID_LEN + 4, "local node")?;
    buf.advance(8);
    let local_id = NodeId::from_bytes(&buf[..NODE_ID_LEN])?;
    buf.advance(NODE_ID_LEN + 4);

    ensure(&buf, 8, "node count")?;
    let count = buf.get_u32() as usize;
    buf.advance(4);

    let mut nodes = Vec::with_capacity(count.min(buf.remaining() / NODE_RECORD_LEN));
    for index in 0..count {
        let record = take(&mut buf, NODE_RECORD_LEN, "node record")?;
        match parse_record(record) {
            Ok(node) => nodes.push(node),
            Err(e) => debug!("Dropping persisted node {}: {}", index, e),
        }
    }

    Ok(SavedRoutingTable {
        local_id,
        serialized_at,
        nodes,
    })
}

fn parse_record(mut record: &[u8]) -> Result<Node, DhtError> {
    let compact_len = record.get_u8() as usize;
    record.advance(7);
    let area = &record[..COMPACT_AREA_LEN];
    record.advance(COMPACT_AREA_LEN);
    let id = NodeId::from_bytes(&record[..NODE_ID_LEN])?;

    let addr = area
        .get(..compact_len)
        .filter(|_| compact_len > 0)
        .and_then(parse_compact_addr)
        .ok_or_else(|| {
            DhtError::MalformedPersistedEntry(format!(
                "node {} has no numeric address (compact length {})",
                id, compact_len
            ))
        })?;

    Ok(Node::new(id, addr))
}

fn ensure(buf: &&[u8], len: usize, what: &str) -> Result<(), DhtError> {
    if buf.remaining() < len {
        return Err(DhtError::Persistence(format!("truncated {}", what)));
    }
    Ok(())
}

fn take<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8], DhtError> {
    ensure(buf, len, what)?;
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Writes to a sibling temp file and renames it over `path`.
pub fn save_to_file(path: &Path, local_id: &NodeId, nodes: &[Node]) -> Result<(), DhtError> {
    let tmp = temp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serialize(&mut writer, local_id, nodes)?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    info!("Saved {} DHT nodes to {}", nodes.len(), path.display());
    Ok(())
}

pub fn load_from_file(path: &Path) -> Result<SavedRoutingTable, DhtError> {
    let file = File::open(path)?;
    let saved = deserialize(&mut BufReader::new(file))?;
    info!("Loaded {} DHT nodes from {}", saved.nodes.len(), path.display());
    Ok(saved)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
