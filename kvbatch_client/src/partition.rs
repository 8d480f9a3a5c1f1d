//! Partition ownership lookup.
use std::{collections::HashMap, fmt::Debug};

use crate::{
    key::{Digest, N_PARTITIONS},
    node::NodeRef,
};

/// Resolves which node currently owns the partition of a digest.
///
/// Implementations must be a pure function of `(namespace, digest)` and their current
/// state, so that keys with equal digests always route to the same node.
pub trait PartitionMap: Debug + Send + Sync + 'static {
    /// Owner of the partition `digest` falls into, or `None` if it is unowned.
    fn resolve_node(&self, namespace: &str, digest: &Digest) -> Option<NodeRef>;
}

/// A fixed partition table.
///
/// Every namespace maps each of its [`N_PARTITIONS`] partitions to an optional owner.
#[derive(Debug, Clone, Default)]
pub struct StaticPartitionMap {
    namespaces: HashMap<String, Vec<Option<NodeRef>>>,
}

impl StaticPartitionMap {
    /// Create an empty map; every lookup is unresolved.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spread all partitions of `namespace` over `nodes` with jump consistent hashing.
    ///
    /// The same node list (in the same order) always produces the same table, and adding a
    /// node moves roughly `1/N` of the partitions. An empty node list leaves every partition
    /// of the namespace unowned.
    pub fn with_namespace(mut self, namespace: impl Into<String>, nodes: &[NodeRef]) -> Self {
        let owners = (0..N_PARTITIONS)
            .map(|partition| {
                (!nodes.is_empty())
                    .then(|| nodes[jump_hash(u64::from(partition), nodes.len())].clone())
            })
            .collect();
        self.namespaces.insert(namespace.into(), owners);
        self
    }

    /// Set (or clear, with `None`) the owner of one partition.
    pub fn assign(&mut self, namespace: &str, partition: u16, node: Option<NodeRef>) {
        let owners = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| vec![None; usize::from(N_PARTITIONS)]);
        if let Some(slot) = owners.get_mut(usize::from(partition)) {
            *slot = node;
        }
    }

    /// Current owner of a partition.
    pub fn owner(&self, namespace: &str, partition: u16) -> Option<&NodeRef> {
        self.namespaces
            .get(namespace)?
            .get(usize::from(partition))?
            .as_ref()
    }
}

impl PartitionMap for StaticPartitionMap {
    fn resolve_node(&self, namespace: &str, digest: &Digest) -> Option<NodeRef> {
        self.owner(namespace, digest.partition_id()).cloned()
    }
}

/// Map `key` to one of `buckets` buckets.
///
/// Lamping & Veach jump consistent hash, seeded with a splitmix64 round so that the small,
/// sequential partition ids spread evenly.
fn jump_hash(key: u64, buckets: usize) -> usize {
    let mut key = splitmix64(key);
    let mut b = -1i64;
    let mut j = 0i64;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
            as i64;
    }
    b.max(0) as usize
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
