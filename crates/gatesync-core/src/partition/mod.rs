//! Identity partitioning.
//!
//! Each node allocates primary keys from its own residue class: with `N`
//! nodes, the node at ordinal `i` only produces keys `k` with
//! `k ≡ i (mod N)`. Independently generated rows therefore never collide,
//! and the rule depends only on static configuration.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Largest cluster the partitioner accepts.
pub const MAX_NODES: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPartitioner {
    ordinal: u32,
    node_count: u32,
}

impl IdPartitioner {
    pub fn new(ordinal: u32, node_count: u32) -> Result<Self, ConfigError> {
        if node_count == 0 || node_count > MAX_NODES {
            return Err(ConfigError::Invalid(format!(
                "node count must be in [1, {MAX_NODES}], got {node_count}"
            )));
        }
        if ordinal == 0 || ordinal > node_count {
            return Err(ConfigError::Invalid(format!(
                "node ordinal must be in [1, {node_count}], got {ordinal}"
            )));
        }
        Ok(Self {
            ordinal,
            node_count,
        })
    }

    pub const fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub const fn node_count(&self) -> u32 {
        self.node_count
    }

    /// `ordinal mod node_count`; zero for the last ordinal.
    pub const fn residue(&self) -> u32 {
        self.ordinal % self.node_count
    }

    /// Whether `id` falls in this node's range.
    pub fn owns(&self, id: i64) -> bool {
        id > 0 && id.rem_euclid(i64::from(self.node_count)) == i64::from(self.residue())
    }

    /// Smallest key in this node's range that is greater than `max_owned`.
    ///
    /// `max_owned` is the highest key this node has allocated so far; the first
    /// key is the ordinal itself.
    pub fn next_id(&self, max_owned: Option<i64>) -> i64 {
        let first = i64::from(self.ordinal);
        let step = i64::from(self.node_count);
        match max_owned {
            Some(max) if max >= first => {
                // step up to the next key of our class strictly above max
                let offset = (max - first) / step + 1;
                first + offset * step
            }
            _ => first,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn allocate(partitioner: &IdPartitioner, count: usize) -> Vec<i64> {
        let mut max = None;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let id = partitioner.next_id(max);
            ids.push(id);
            max = Some(id);
        }
        ids
    }

    #[test]
    fn two_nodes_split_odd_and_even() {
        let first = IdPartitioner::new(1, 2).unwrap();
        let second = IdPartitioner::new(2, 2).unwrap();

        assert_eq!(allocate(&first, 4), vec![1, 3, 5, 7]);
        assert_eq!(allocate(&second, 4), vec![2, 4, 6, 8]);
    }

    #[test]
    fn ranges_never_collide_for_any_cluster_size() {
        for node_count in 1..=8 {
            let mut seen = HashSet::new();
            for ordinal in 1..=node_count {
                let partitioner = IdPartitioner::new(ordinal, node_count).unwrap();
                for id in allocate(&partitioner, 50) {
                    assert!(partitioner.owns(id));
                    assert!(seen.insert(id), "id {id} allocated twice (N={node_count})");
                }
            }
        }
    }

    #[test]
    fn next_id_skips_past_foreign_or_misaligned_max() {
        let partitioner = IdPartitioner::new(2, 3).unwrap();
        assert_eq!(partitioner.next_id(Some(2)), 5);
        assert_eq!(partitioner.next_id(Some(6)), 8);
        assert_eq!(partitioner.next_id(Some(-4)), 2);
    }

    #[test]
    fn rejects_invalid_identity() {
        assert!(IdPartitioner::new(0, 2).is_err());
        assert!(IdPartitioner::new(3, 2).is_err());
        assert!(IdPartitioner::new(1, MAX_NODES + 1).is_err());
    }

    #[test]
    fn owns_matches_residue_class() {
        let last = IdPartitioner::new(3, 3).unwrap();
        assert!(last.owns(3));
        assert!(last.owns(6));
        assert!(!last.owns(4));
        assert!(!last.owns(0));
    }
}
