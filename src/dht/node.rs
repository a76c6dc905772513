use super::error::DhtError;
use crate::constants::{MAX_NODE_FAILURES, NODE_GOOD_WINDOW, NODE_ID_LEN};
use crate::socket::PeerAddr;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

/// Compact node info: 20-byte id followed by a compact IPv4 address.
pub const COMPACT_NODE_V4_LEN: usize = NODE_ID_LEN + 6;
/// Compact node info: 20-byte id followed by a compact IPv6 address.
pub const COMPACT_NODE_V6_LEN: usize = NODE_ID_LEN + 18;

/// A 160-bit node identifier.
///
/// Ids have no natural order. They are compared through [`NodeId::distance`]
/// to some reference id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// The all-zero id, lower bound of the id space.
    pub const MIN: NodeId = NodeId([0u8; NODE_ID_LEN]);
    /// The all-ones id, upper bound of the id space.
    pub const MAX: NodeId = NodeId([0xFF; NODE_ID_LEN]);

    pub fn generate() -> Self {
        let mut id = [0u8; NODE_ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut dist = [0u8; NODE_ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        Distance(dist)
    }

    /// Bit `index`, counted from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn with_bit(mut self, index: usize, set: bool) -> Self {
        let mask = 0x80 >> (index % 8);
        if set {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
        self
    }

    /// Takes the first `prefix_len` bits from `prefix` and the rest from `self`.
    pub fn with_prefix(mut self, prefix: &NodeId, prefix_len: usize) -> Self {
        let full = prefix_len / 8;
        self.0[..full].copy_from_slice(&prefix.0[..full]);

        let rem = prefix_len % 8;
        if rem > 0 {
            let mask = 0xFFu8 << (8 - rem);
            self.0[full] = (prefix.0[full] & mask) | (self.0[full] & !mask);
        }
        self
    }

    /// Uniformly random id sharing the first `prefix_len` bits of `prefix`.
    pub fn random_with_prefix(prefix: &NodeId, prefix_len: usize) -> Self {
        Self::generate().with_prefix(prefix, prefix_len)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// XOR distance between two ids, ordered as a big-endian unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; NODE_ID_LEN]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        NODE_ID_LEN * 8
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(lz={})", self.leading_zeros())
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: PeerAddr,
    pub last_seen: Instant,
    pub failures: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: PeerAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_good(&self) -> bool {
        self.failures == 0 && self.last_seen.elapsed() < NODE_GOOD_WINDOW
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_NODE_FAILURES
    }

    /// Parses a 26-byte (IPv4) or 38-byte (IPv6) compact node info.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        if data.len() != COMPACT_NODE_V4_LEN && data.len() != COMPACT_NODE_V6_LEN {
            return None;
        }

        let id = NodeId::from_bytes(&data[..NODE_ID_LEN]).ok()?;
        let addr = parse_compact_addr(&data[NODE_ID_LEN..])?;
        Some(Self::new(id, addr))
    }

    /// `None` when the host is not a numeric address.
    pub fn to_compact(&self) -> Option<Vec<u8>> {
        let addr = compact_addr(&self.addr)?;
        let mut compact = Vec::with_capacity(NODE_ID_LEN + addr.len());
        compact.extend_from_slice(&self.id.0);
        compact.extend_from_slice(&addr);
        Some(compact)
    }
}

/// Compact address: 4 or 16 address bytes followed by a big-endian port.
pub(crate) fn compact_addr(addr: &PeerAddr) -> Option<Vec<u8>> {
    let mut compact = match addr.ip()? {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    compact.extend_from_slice(&addr.port.to_be_bytes());
    Some(compact)
}

pub(crate) fn parse_compact_addr(data: &[u8]) -> Option<PeerAddr> {
    let (ip, port) = match data.len() {
        6 => {
            let octets: [u8; 4] = data[..4].try_into().ok()?;
            (IpAddr::V4(Ipv4Addr::from(octets)), &data[4..])
        }
        18 => {
            let octets: [u8; 16] = data[..16].try_into().ok()?;
            (IpAddr::V6(Ipv6Addr::from(octets)), &data[16..])
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([port[0], port[1]]);
    Some(PeerAddr::new(ip.to_string(), port))
}
