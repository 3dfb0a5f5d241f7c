//! The per-epoch validator set.
//!
//! [`Validators`] is immutable for the lifetime of an epoch. It provides the
//! dense index assignment and the deterministic iteration order every
//! decision loop in the engine depends on: descending weight, ascending id
//! as the tie-break. Relying on incidental map ordering anywhere in
//! consensus is a consensus-splitting bug.

use std::collections::HashMap;
use std::fmt;

use crate::{ValidatorId, ValidatorIdx, Weight};

/// Immutable weighted validator set for one epoch.
#[derive(Clone, PartialEq, Eq)]
pub struct Validators {
    /// Ids in canonical order: descending weight, then ascending id.
    sorted_ids: Vec<ValidatorId>,
    /// Weights, parallel to `sorted_ids` (index = `ValidatorIdx`).
    weights: Vec<Weight>,
    idx_by_id: HashMap<ValidatorId, ValidatorIdx>,
    total_weight: u64,
}

/// Builder accumulating id → weight assignments.
#[derive(Default, Clone)]
pub struct ValidatorsBuilder {
    weights: HashMap<ValidatorId, Weight>,
}

impl ValidatorsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or overwrite) a validator's weight. Zero-weight entries are
    /// dropped at build time: a validator with no stake cannot vote.
    pub fn set(&mut self, id: ValidatorId, weight: Weight) -> &mut Self {
        self.weights.insert(id, weight);
        self
    }

    /// Finalize into an immutable set.
    pub fn build(&self) -> Validators {
        let mut entries: Vec<(ValidatorId, Weight)> = self
            .weights
            .iter()
            .filter(|(_, w)| w.0 > 0)
            .map(|(id, w)| (*id, *w))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let sorted_ids: Vec<ValidatorId> = entries.iter().map(|(id, _)| *id).collect();
        let weights: Vec<Weight> = entries.iter().map(|(_, w)| *w).collect();
        let idx_by_id = sorted_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as ValidatorIdx))
            .collect();
        let total_weight = weights.iter().map(|w| w.as_u64()).sum();

        Validators {
            sorted_ids,
            weights,
            idx_by_id,
            total_weight,
        }
    }
}

impl Validators {
    /// Build directly from `(id, weight)` pairs.
    pub fn from_entries(entries: &[(ValidatorId, Weight)]) -> Self {
        let mut b = ValidatorsBuilder::new();
        for (id, w) in entries {
            b.set(*id, *w);
        }
        b.build()
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.sorted_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_ids.is_empty()
    }

    /// Sum of all weights.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Quorum threshold `⌊2T/3⌋ + 1`.
    pub fn quorum(&self) -> u64 {
        self.total_weight * 2 / 3 + 1
    }

    /// Ids in canonical order (descending weight, ascending id).
    pub fn sorted_ids(&self) -> &[ValidatorId] {
        &self.sorted_ids
    }

    /// Weight of a validator, if a member.
    pub fn get(&self, id: ValidatorId) -> Option<Weight> {
        self.idx_by_id.get(&id).map(|i| self.weights[*i as usize])
    }

    /// Whether `id` belongs to this set.
    pub fn contains(&self, id: ValidatorId) -> bool {
        self.idx_by_id.contains_key(&id)
    }

    /// Dense index of a validator.
    pub fn idx(&self, id: ValidatorId) -> Option<ValidatorIdx> {
        self.idx_by_id.get(&id).copied()
    }

    /// Id at a dense index.
    pub fn id_of(&self, idx: ValidatorIdx) -> ValidatorId {
        self.sorted_ids[idx as usize]
    }

    /// Weight at a dense index.
    pub fn weight_by_idx(&self, idx: ValidatorIdx) -> Weight {
        self.weights[idx as usize]
    }

    /// The id → dense index map (cloned snapshot).
    pub fn idx_map(&self) -> HashMap<ValidatorId, ValidatorIdx> {
        self.idx_by_id.clone()
    }

    /// Iterate `(id, weight)` in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (ValidatorId, Weight)> + '_ {
        self.sorted_ids
            .iter()
            .zip(self.weights.iter())
            .map(|(id, w)| (*id, *w))
    }

    /// Fresh weight counter for quorum checks.
    pub fn counter(&self) -> WeightCounter<'_> {
        WeightCounter {
            validators: self,
            counted: vec![false; self.len()],
            sum: 0,
        }
    }
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validators(n={}, total={})", self.len(), self.total_weight)
    }
}

/// Accumulates distinct validators' weights toward the quorum threshold.
pub struct WeightCounter<'a> {
    validators: &'a Validators,
    counted: Vec<bool>,
    sum: u64,
}

impl WeightCounter<'_> {
    /// Count a validator once; returns false if already counted.
    pub fn count(&mut self, idx: ValidatorIdx) -> bool {
        let i = idx as usize;
        if self.counted[i] {
            return false;
        }
        self.counted[i] = true;
        self.sum += self.validators.weight_by_idx(idx).as_u64();
        true
    }

    /// Accumulated weight.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Whether the accumulated weight reaches `⌊2T/3⌋ + 1`.
    pub fn has_quorum(&self) -> bool {
        self.sum >= self.validators.quorum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(weights: &[(u32, u32)]) -> Validators {
        let entries: Vec<_> = weights
            .iter()
            .map(|(id, w)| (ValidatorId(*id), Weight(*w)))
            .collect();
        Validators::from_entries(&entries)
    }

    #[test]
    fn test_sorted_order_is_weight_desc_then_id_asc() {
        let v = set(&[(3, 5), (1, 5), (2, 9), (4, 1)]);
        let ids: Vec<u32> = v.sorted_ids().iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
        assert_eq!(v.idx(ValidatorId(2)), Some(0));
        assert_eq!(v.id_of(2), ValidatorId(3));
    }

    #[test]
    fn test_zero_weight_dropped() {
        let v = set(&[(1, 4), (2, 0)]);
        assert_eq!(v.len(), 1);
        assert!(!v.contains(ValidatorId(2)));
    }

    #[test]
    fn test_quorum_threshold() {
        let v = set(&[(1, 1), (2, 1), (3, 1), (4, 1)]);
        assert_eq!(v.quorum(), 3);
        let v = set(&[(1, 33), (2, 67)]);
        assert_eq!(v.quorum(), 67);
    }

    #[test]
    fn test_total_weight_does_not_overflow_u32() {
        let v = set(&[(1, u32::MAX / 2), (2, u32::MAX / 2), (3, 3)]);
        assert_eq!(v.total_weight(), u64::from(u32::MAX / 2) * 2 + 3);
    }

    #[test]
    fn test_weight_counter_counts_each_validator_once() {
        let v = set(&[(1, 2), (2, 1), (3, 1)]);
        let mut c = v.counter();
        assert!(c.count(0));
        assert!(!c.count(0));
        assert_eq!(c.sum(), 2);
        assert!(!c.has_quorum());
        c.count(1);
        assert!(c.has_quorum());
    }
}
