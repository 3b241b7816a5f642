//! Replica identities and version vectors.
//!
//! A version vector maps each replica to the last tick at which that replica
//! mutated an item. Comparing two vectors tells whether one change causally
//! follows the other or whether they happened concurrently.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable identity of a replica, persisted in its metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Causal relationship between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    /// Identical vectors.
    Equal,
    /// `self` is causally after `other`.
    Dominates,
    /// `other` is causally after `self`.
    DominatedBy,
    /// Neither dominates: the changes conflict.
    Concurrent,
}

/// Mapping from replica identity to a monotonically increasing tick.
///
/// Missing components are treated as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<ReplicaId, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// A vector with a single component.
    pub fn single(replica: ReplicaId, tick: u64) -> Self {
        let mut vector = Self::new();
        vector.record(replica, tick);
        vector
    }

    /// Tick recorded for `replica` (zero when absent).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Record a mutation by `replica` at `tick`.
    ///
    /// Ticks never go backwards: a smaller tick than the one already stored is
    /// ignored.
    pub fn record(&mut self, replica: ReplicaId, tick: u64) {
        let entry = self.0.entry(replica).or_insert(0);
        if tick > *entry {
            *entry = tick;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|tick| *tick == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.0.iter()
    }

    /// Compare two vectors component-wise.
    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        let mut greater = false;
        let mut less = false;

        for replica in self.0.keys().chain(other.0.keys()) {
            match self.get(replica).cmp(&other.get(replica)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return VectorOrdering::Concurrent;
            }
        }

        match (greater, less) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Dominates,
            (false, true) => VectorOrdering::DominatedBy,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    /// `self >= other` everywhere and `>` somewhere.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Dominates
    }

    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Concurrent
    }

    /// Component-wise maximum of both vectors.
    pub fn merged(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        for (replica, tick) in &other.0 {
            merged.record(*replica, *tick);
        }
        merged
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (replica, tick)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let short = replica.to_string();
            write!(f, "{}:{}", &short[..8], tick)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn replicas() -> (ReplicaId, ReplicaId) {
        (ReplicaId::generate(), ReplicaId::generate())
    }

    #[test]
    fn test_compare_basic_orderings() {
        let (a, b) = replicas();
        let v1 = VersionVector::single(a, 1);
        let mut v2 = v1.clone();
        v2.record(a, 2);

        assert_eq!(v1.compare(&v1), VectorOrdering::Equal);
        assert_eq!(v2.compare(&v1), VectorOrdering::Dominates);
        assert_eq!(v1.compare(&v2), VectorOrdering::DominatedBy);

        let mut v3 = v1.clone();
        v3.record(b, 1);
        assert_eq!(v2.compare(&v3), VectorOrdering::Concurrent);
        assert!(v2.is_concurrent_with(&v3));
    }

    #[test]
    fn test_missing_component_is_zero() {
        let (a, b) = replicas();
        let mut v = VersionVector::single(a, 3);
        v.record(b, 0);
        assert_eq!(v.compare(&VersionVector::single(a, 3)), VectorOrdering::Equal);
        assert_eq!(v.get(&b), 0);
        assert!(VersionVector::new().is_empty());
    }

    #[test]
    fn test_record_never_moves_backwards() {
        let (a, _) = replicas();
        let mut v = VersionVector::single(a, 5);
        v.record(a, 2);
        assert_eq!(v.get(&a), 5);
    }

    #[test]
    fn test_merge_dominates_concurrent_inputs() {
        let (a, b) = replicas();
        let left = VersionVector::single(a, 4);
        let right = VersionVector::single(b, 7);
        let merged = left.merged(&right);

        assert!(merged.dominates(&left));
        assert!(merged.dominates(&right));
        assert_eq!(merged.get(&a), 4);
        assert_eq!(merged.get(&b), 7);
    }

    fn vector_strategy(a: ReplicaId, b: ReplicaId) -> impl Strategy<Value = VersionVector> {
        (0u64..6, 0u64..6).prop_map(move |(x, y)| {
            let mut v = VersionVector::new();
            v.record(a, x);
            v.record(b, y);
            v
        })
    }

    proptest! {
        #[test]
        fn prop_comparison_is_antisymmetric(seed in any::<u128>(), other_seed in any::<u128>(),
                                            xs in (0u64..6, 0u64..6), ys in (0u64..6, 0u64..6)) {
            let a = ReplicaId::from_uuid(Uuid::from_u128(seed));
            let b = ReplicaId::from_uuid(Uuid::from_u128(other_seed ^ 1));
            let mut left = VersionVector::new();
            left.record(a, xs.0);
            left.record(b, xs.1);
            let mut right = VersionVector::new();
            right.record(a, ys.0);
            right.record(b, ys.1);

            let expected = match left.compare(&right) {
                VectorOrdering::Equal => VectorOrdering::Equal,
                VectorOrdering::Dominates => VectorOrdering::DominatedBy,
                VectorOrdering::DominatedBy => VectorOrdering::Dominates,
                VectorOrdering::Concurrent => VectorOrdering::Concurrent,
            };
            prop_assert_eq!(right.compare(&left), expected);
        }

        #[test]
        fn prop_merge_is_upper_bound(
            (left, right) in {
                let (a, b) = (ReplicaId::from_uuid(Uuid::from_u128(1)), ReplicaId::from_uuid(Uuid::from_u128(2)));
                (vector_strategy(a, b), vector_strategy(a, b))
            }
        ) {
            let merged = left.merged(&right);
            prop_assert!(matches!(merged.compare(&left), VectorOrdering::Dominates | VectorOrdering::Equal));
            prop_assert!(matches!(merged.compare(&right), VectorOrdering::Dominates | VectorOrdering::Equal));
            if left.is_concurrent_with(&right) {
                prop_assert!(merged.dominates(&left) && merged.dominates(&right));
            }
        }
    }
}
