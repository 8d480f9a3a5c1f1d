//! Splitting a batch into per-node legs.
use std::sync::Arc;

use indexmap::IndexMap;

use crate::{error::Error, key::Key, node::NodeRef, partition::PartitionMap};

/// The keys of one batch that one node answers for one namespace.
///
/// `key_indices` are positions in the caller's key list, in caller order, so rows coming
/// back from this node can be attributed to the original keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchNamespace {
    /// Namespace shared by all keys of the leg.
    pub namespace: Arc<str>,

    /// Node owning all keys of the leg.
    pub node: NodeRef,

    /// Positions in the caller's key list.
    pub key_indices: Vec<usize>,
}

/// Group `keys` by owning node and namespace.
///
/// Legs are returned in the order their first key appears. Every index of `keys` is part
/// of exactly one leg. If any key has no owner the whole batch is rejected with
/// [`Error::ClusterUnavailable`].
pub fn partition_keys(
    keys: &[Key],
    partition_map: &dyn PartitionMap,
) -> Result<Vec<BatchNamespace>, Error> {
    let mut legs: IndexMap<(NodeRef, &str), BatchNamespace> = IndexMap::new();

    for (index, key) in keys.iter().enumerate() {
        let node = partition_map
            .resolve_node(key.namespace(), key.digest())
            .ok_or_else(|| Error::ClusterUnavailable {
                namespace: key.namespace().to_string(),
                partition: key.digest().partition_id(),
            })?;

        legs.entry((node.clone(), key.namespace()))
            .or_insert_with(|| BatchNamespace {
                namespace: Arc::from(key.namespace()),
                node,
                key_indices: vec![],
            })
            .key_indices
            .push(index);
    }

    Ok(legs.into_values().collect())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::{key::N_PARTITIONS, partition::StaticPartitionMap};

    use super::*;

    fn nodes(n: usize) -> Vec<NodeRef> {
        (0..n)
            .map(|i| NodeRef::new(format!("node-{i}"), format!("10.0.0.{i}:3000")))
            .collect()
    }

    fn keys(n: usize) -> Vec<Key> {
        (1..=n)
            .map(|i| Key::new("test", "demo", format!("batchkey{i}")))
            .collect()
    }

    #[test]
    fn test_groups_by_owner() {
        let nodes = nodes(3);
        let map = StaticPartitionMap::new().with_namespace("test", &nodes);
        let keys = keys(50);

        let legs = partition_keys(&keys, &map).unwrap();
        assert!(legs.len() <= 3);

        for leg in &legs {
            assert_eq!(leg.namespace.as_ref(), "test");
            assert!(leg.key_indices.windows(2).all(|w| w[0] < w[1]));
            for &i in &leg.key_indices {
                assert_eq!(
                    map.resolve_node("test", keys[i].digest()).as_ref(),
                    Some(&leg.node)
                );
            }
        }

        // legs appear in order of their first key
        let firsts = legs.iter().map(|l| l.key_indices[0]).collect::<Vec<_>>();
        assert_eq!(firsts[0], 0);
        assert!(firsts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_namespaces_split_legs() {
        let nodes = nodes(1);
        let map = StaticPartitionMap::new()
            .with_namespace("test", &nodes)
            .with_namespace("bar", &nodes);
        let keys = vec![
            Key::new("test", "demo", 1i64),
            Key::new("bar", "demo", 2i64),
            Key::new("test", "demo", 3i64),
        ];

        let legs = partition_keys(&keys, &map).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].namespace.as_ref(), "test");
        assert_eq!(legs[0].key_indices, vec![0, 2]);
        assert_eq!(legs[1].namespace.as_ref(), "bar");
        assert_eq!(legs[1].key_indices, vec![1]);
    }

    #[test]
    fn test_unowned_partition_fails_whole_batch() {
        let nodes = nodes(2);
        let mut map = StaticPartitionMap::new().with_namespace("test", &nodes);
        let keys = keys(8);
        let lost = keys[5].digest().partition_id();
        map.assign("test", lost, None);

        match partition_keys(&keys, &map) {
            Err(Error::ClusterUnavailable {
                namespace,
                partition,
            }) => {
                assert_eq!(namespace, "test");
                assert_eq!(partition, lost);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty() {
        let map = StaticPartitionMap::new();
        assert!(partition_keys(&[], &map).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_legs_partition_indices(
            user_keys in prop::collection::hash_set(any::<i64>(), 0..200),
            node_count in 1usize..8,
            owners in prop::collection::vec(any::<prop::sample::Index>(), N_PARTITIONS as usize),
        ) {
            let nodes = nodes(node_count);
            let mut map = StaticPartitionMap::new();
            for (partition, owner) in owners.iter().enumerate() {
                map.assign("test", partition as u16, Some(owner.get(&nodes).clone()));
            }
            let keys = user_keys
                .into_iter()
                .map(|k| Key::new("test", "demo", k))
                .collect::<Vec<_>>();

            let legs = partition_keys(&keys, &map).unwrap();

            let mut seen = legs
                .iter()
                .flat_map(|l| l.key_indices.iter().copied())
                .collect::<Vec<_>>();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..keys.len()).collect::<Vec<_>>());

            for leg in &legs {
                for &i in &leg.key_indices {
                    let owner = map.resolve_node("test", keys[i].digest());
                    prop_assert_eq!(owner.as_ref(), Some(&leg.node));
                }
            }

            let leg_nodes = legs
                .iter()
                .map(|l| l.node.clone())
                .collect::<std::collections::HashSet<_>>();
            prop_assert_eq!(leg_nodes.len(), legs.len());
        }
    }
}
