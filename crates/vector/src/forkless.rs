//! The forkless-cause oracle.
//!
//! `forkless_cause(a, b)` holds when the validators whose chains both reach
//! `b` and are observed far enough by `a` — without `a` having observed an
//! equivocation by them — carry at least `⌊2T/3⌋ + 1` of the total stake.
//! The predicate is pure over the epoch's immutable ancestry, so results
//! are memoized until the epoch resets.

use moira_types::{BranchId, EventHash, ValidatorIdx};

use crate::engine::{Inner, VectorError};
use crate::HighestBeforeSeq;

impl Inner {
    pub(crate) fn forkless_cause(
        &mut self,
        a: &EventHash,
        b: &EventHash,
    ) -> Result<bool, VectorError> {
        if let Some(&cached) = self.forkless_cause_cache.get(&(*a, *b)) {
            return Ok(cached);
        }
        let res = self.forkless_cause_uncached(a, b)?;
        self.forkless_cause_cache.put((*a, *b), res);
        Ok(res)
    }

    fn forkless_cause_uncached(
        &mut self,
        a: &EventHash,
        b: &EventHash,
    ) -> Result<bool, VectorError> {
        let a_highest = self.merged_highest_before(a)?.ok_or_else(|| {
            VectorError::InconsistentStore(format!("event {a} is not indexed"))
        })?;
        let b_lowest = self.get_lowest_after(b)?.ok_or_else(|| {
            VectorError::InconsistentStore(format!("event {b} is not indexed"))
        })?;

        let mut counted = self.validators.counter();
        for idx in 0..self.validators.len() as ValidatorIdx {
            let lowest = b_lowest.get(idx);
            let highest = a_highest.get(idx);
            // The validator's chain reaches b (lowest != 0) and a observes
            // that chain far enough, with no equivocation seen.
            if lowest.0 != 0 && lowest <= highest.seq && !highest.is_fork_detected() {
                counted.count(idx);
            }
        }
        Ok(counted.has_quorum())
    }

    pub(crate) fn merged_highest_before(
        &mut self,
        id: &EventHash,
    ) -> Result<Option<HighestBeforeSeq>, VectorError> {
        self.ensure_branches()?;
        let n = self.validators.len();
        let branches_by_creator = {
            let branches = self.branches.as_ref().expect("branches loaded");
            if branches.at_least_one_fork(n) {
                Some(branches.branches_by_creator.clone())
            } else {
                None
            }
        };

        match branches_by_creator {
            Some(by_creator) => {
                let Some(scattered) = self.get_highest_before(id)? else {
                    return Ok(None);
                };
                let mut merged = HighestBeforeSeq::new(n);
                for (creator_idx, branches) in by_creator.iter().enumerate() {
                    merged.gather_from(creator_idx as BranchId, &scattered, branches);
                }
                Ok(Some(merged))
            }
            None => self.get_highest_before(id),
        }
    }
}
