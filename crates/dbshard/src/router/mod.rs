//! Deterministic key → shard routing.
//!
//! Keys are hashed with the first 8 bytes of SHA-256 over a type-tagged
//! encoding, so a key maps to the same shard across processes, platforms and
//! releases. Without buckets the hash is reduced modulo the shard count; with
//! buckets every shard contributes `virtual_nodes` points to a consistent-hash
//! ring, which limits remapping when shards are added.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::core::SqlValue;
use crate::error::{Result, ShardError};
use crate::topology::{ShardId, ShardTopology};

/// Default number of ring points per bucketed shard.
pub const DEFAULT_VIRTUAL_NODES: u32 = 64;

/// An entity key that can be routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardKey {
    /// Integer key (covers int, bigint, smallint).
    Int(i64),
    /// UUID/GUID key.
    Uuid(Uuid),
    /// String key.
    Text(String),
    /// Raw binary key.
    Bytes(Vec<u8>),
}

impl ShardKey {
    /// Stable 64-bit hash of the key.
    ///
    /// A type tag is hashed first so `Int(1)` and `Text("1")` differ.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        match self {
            ShardKey::Int(v) => {
                hasher.update([0u8]);
                hasher.update(v.to_be_bytes());
            }
            ShardKey::Uuid(v) => {
                hasher.update([1u8]);
                hasher.update(v.as_bytes());
            }
            ShardKey::Text(v) => {
                hasher.update([2u8]);
                hasher.update(v.as_bytes());
            }
            ShardKey::Bytes(v) => {
                hasher.update([3u8]);
                hasher.update(v);
            }
        }
        prefix_u64(&hasher.finalize())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Int(v) => write!(f, "{}", v),
            ShardKey::Uuid(v) => write!(f, "{}", v),
            ShardKey::Text(v) => write!(f, "{}", v),
            ShardKey::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
        }
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        ShardKey::Int(v)
    }
}

impl From<i32> for ShardKey {
    fn from(v: i32) -> Self {
        ShardKey::Int(v as i64)
    }
}

impl From<Uuid> for ShardKey {
    fn from(v: Uuid) -> Self {
        ShardKey::Uuid(v)
    }
}

impl From<String> for ShardKey {
    fn from(v: String) -> Self {
        ShardKey::Text(v)
    }
}

impl From<&str> for ShardKey {
    fn from(v: &str) -> Self {
        ShardKey::Text(v.to_string())
    }
}

impl From<Vec<u8>> for ShardKey {
    fn from(v: Vec<u8>) -> Self {
        ShardKey::Bytes(v)
    }
}

impl TryFrom<&SqlValue> for ShardKey {
    type Error = ShardError;

    fn try_from(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::I64(v) => Ok(ShardKey::Int(*v)),
            SqlValue::Uuid(v) => Ok(ShardKey::Uuid(*v)),
            SqlValue::Text(v) => Ok(ShardKey::Text(v.clone())),
            SqlValue::Bytes(v) => Ok(ShardKey::Bytes(v.clone())),
            other => Err(ShardError::Routing(format!(
                "unsupported key type '{}'",
                other.type_name()
            ))),
        }
    }
}

fn prefix_u64(digest: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn ring_point(bucket: u32, replica: u32) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"vnode");
    hasher.update(bucket.to_be_bytes());
    hasher.update(replica.to_be_bytes());
    prefix_u64(&hasher.finalize())
}

/// Maps entity keys to shard ids for one topology version.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    topology: Arc<ShardTopology>,
    /// Ring point → position in topology order. Empty for modulo routing.
    ring: BTreeMap<u64, usize>,
}

impl ShardRouter {
    /// Create a router with [`DEFAULT_VIRTUAL_NODES`] ring points per shard.
    pub fn new(topology: Arc<ShardTopology>) -> Result<Self> {
        Self::with_virtual_nodes(topology, DEFAULT_VIRTUAL_NODES)
    }

    /// Create a router with an explicit number of ring points per shard.
    pub fn with_virtual_nodes(topology: Arc<ShardTopology>, virtual_nodes: u32) -> Result<Self> {
        if topology.is_empty() {
            return Err(ShardError::Routing("topology has no shards".into()));
        }
        if virtual_nodes == 0 {
            return Err(ShardError::Config("virtual_nodes must be at least 1".into()));
        }

        let mut ring = BTreeMap::new();
        if topology.is_bucketed() {
            for (pos, shard) in topology.shards().iter().enumerate() {
                let Some(bucket) = shard.bucket else {
                    continue;
                };
                for replica in 0..virtual_nodes {
                    // Earliest-declared shard keeps a colliding point.
                    ring.entry(ring_point(bucket, replica)).or_insert(pos);
                }
            }
            debug!(
                "Built hash ring for topology v{}: {} points over {} shards",
                topology.version(),
                ring.len(),
                topology.len()
            );
        }

        Ok(Self { topology, ring })
    }

    pub fn topology(&self) -> &Arc<ShardTopology> {
        &self.topology
    }

    pub fn topology_version(&self) -> u64 {
        self.topology.version()
    }

    /// Resolve the shard that owns `key`.
    pub fn resolve(&self, key: &ShardKey) -> Result<ShardId> {
        let pos = self.position_for(key.stable_hash());
        Ok(self.topology.shards()[pos].id.clone())
    }

    /// Resolve a raw SQL value, rejecting unsupported key types.
    pub fn resolve_value(&self, value: &SqlValue) -> Result<ShardId> {
        self.resolve(&ShardKey::try_from(value)?)
    }

    /// Group keys by owning shard, in topology order.
    pub fn resolve_many<'k, I>(&self, keys: I) -> Result<Vec<(ShardId, Vec<ShardKey>)>>
    where
        I: IntoIterator<Item = &'k ShardKey>,
    {
        let mut grouped: HashMap<usize, Vec<ShardKey>> = HashMap::new();
        for key in keys {
            let pos = self.position_for(key.stable_hash());
            grouped.entry(pos).or_default().push(key.clone());
        }

        let mut groups: Vec<(usize, Vec<ShardKey>)> = grouped.into_iter().collect();
        groups.sort_unstable_by_key(|(pos, _)| *pos);
        Ok(groups
            .into_iter()
            .map(|(pos, keys)| (self.topology.shards()[pos].id.clone(), keys))
            .collect())
    }

    fn position_for(&self, hash: u64) -> usize {
        if self.ring.is_empty() {
            return (hash % self.topology.len() as u64) as usize;
        }
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &pos)| pos)
            .unwrap_or(0)
    }
}
