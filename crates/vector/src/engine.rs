//! The vector index: per-event clock computation and fork detection.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use moira_kvdb::Flushable;
use moira_types::{
    BranchId, Event, EventHash, EventSource, ValidatorId, ValidatorIdx, Validators,
};
use tracing::debug;

use crate::store::Tables;
use crate::{BranchesInfo, HighestBeforeSeq, LowestAfterSeq, VectorIndexConfig};

/// Errors raised by the vector index.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorError {
    /// The caller fed an event before one of its parents. Recoverable:
    /// drop staged writes and re-feed in topological order.
    #[error("parent {0} not indexed, event processed out of order")]
    ParentMissing(EventHash),

    /// The event's creator is not a member of the current validator set.
    #[error("creator {0} is not in the validator set")]
    UnknownCreator(ValidatorId),

    /// A persisted record is missing or does not decode; the epoch state is
    /// corrupt and must not be used further.
    #[error("inconsistent store: {0}")]
    InconsistentStore(String),

    #[error(transparent)]
    Kv(#[from] moira_kvdb::KvError),
}

/// Handler for non-recoverable failures (store corruption, I/O errors on
/// read paths that cannot propagate a `Result`). Expected to abort or
/// initiate shutdown; the index returns neutral values after invoking it.
pub type CriticalHandler = Arc<dyn Fn(&VectorError) + Send + Sync>;

/// Vector-clock index over the event DAG.
///
/// Owns the per-epoch vector tables and the mutable [`BranchesInfo`];
/// computes highest-before / lowest-after vectors for every added event,
/// detects equivocations, and answers [`VectorIndex::forkless_cause`].
///
/// The handle is internally synchronized so it can be shared with the
/// election through `Arc`; the engine drives it from a single thread and
/// the locks are uncontended.
pub struct VectorIndex {
    inner: Mutex<Inner>,
    crit: CriticalHandler,
}

pub(crate) struct Inner {
    pub(crate) validators: Validators,
    pub(crate) validator_idxs: HashMap<ValidatorId, ValidatorIdx>,
    /// Loaded lazily; `None` after `drop_not_flushed` so the next `add`
    /// rereads the last flushed snapshot.
    pub(crate) branches: Option<BranchesInfo>,
    pub(crate) events: Arc<dyn EventSource>,
    pub(crate) db: Arc<Flushable>,
    pub(crate) tables: Tables,
    pub(crate) highest_before_cache: LruCache<EventHash, HighestBeforeSeq>,
    pub(crate) lowest_after_cache: LruCache<EventHash, LowestAfterSeq>,
    pub(crate) forkless_cause_cache: LruCache<(EventHash, EventHash), bool>,
}

impl VectorIndex {
    pub fn new(
        config: VectorIndexConfig,
        validators: &Validators,
        db: Arc<Flushable>,
        events: Arc<dyn EventSource>,
        crit: CriticalHandler,
    ) -> Self {
        let cap = |n: usize| NonZeroUsize::new(n.max(1)).expect("nonzero cache capacity");
        VectorIndex {
            inner: Mutex::new(Inner {
                validators: validators.clone(),
                validator_idxs: validators.idx_map(),
                branches: None,
                events,
                tables: Tables::open(Arc::clone(&db)),
                db,
                highest_before_cache: LruCache::new(cap(config.highest_before_entries)),
                lowest_after_cache: LruCache::new(cap(config.lowest_after_entries)),
                forkless_cause_cache: LruCache::new(cap(config.forkless_cause_pairs)),
            }),
            crit,
        }
    }

    /// Compute and persist the event's vectors; update ancestors'
    /// lowest-after. Idempotent for an already-indexed event.
    ///
    /// On failure the caller must invoke [`VectorIndex::drop_not_flushed`]
    /// before feeding further events.
    pub fn add(&self, e: &dyn Event) -> Result<(), VectorError> {
        let mut inner = self.lock();
        inner.ensure_branches()?;
        if inner.get_highest_before(&e.id())?.is_some() {
            return Ok(());
        }
        inner.fill_event_vectors(e)
    }

    /// Durably persist all staged writes, including the branches-info
    /// record.
    pub fn flush(&self) {
        let mut inner = self.lock();
        if let Err(err) = inner.flush() {
            (self.crit)(&err);
        }
    }

    /// Discard staged writes and in-memory branches info; the next `add`
    /// reloads the last flushed snapshot.
    pub fn drop_not_flushed(&self) {
        let mut inner = self.lock();
        inner.branches = None;
        if inner.db.not_flushed_pairs() != 0 {
            inner.db.drop_not_flushed();
        }
        inner.highest_before_cache.clear();
        inner.lowest_after_cache.clear();
    }

    /// Swap in a fresh epoch: new validator set, new (empty) epoch store.
    /// All caches and branch state are dropped.
    pub fn reset_epoch(&self, validators: &Validators, db: Arc<Flushable>) {
        let mut inner = self.lock();
        inner.validators = validators.clone();
        inner.validator_idxs = validators.idx_map();
        inner.tables = Tables::open(Arc::clone(&db));
        inner.db = db;
        inner.branches = None;
        inner.highest_before_cache.clear();
        inner.lowest_after_cache.clear();
        inner.forkless_cause_cache.clear();
    }

    /// Whether `a` observes `b` through a quorum of stake without observing
    /// an equivocation by any counted validator.
    ///
    /// Memoized; ancestry is immutable within an epoch so entries are only
    /// invalidated by [`VectorIndex::reset_epoch`].
    pub fn forkless_cause(&self, a: &EventHash, b: &EventHash) -> bool {
        let mut inner = self.lock();
        match inner.forkless_cause(a, b) {
            Ok(res) => res,
            Err(err) => {
                (self.crit)(&err);
                false
            }
        }
    }

    /// The event's highest-before vector collapsed to one entry per
    /// validator (fork marker wins, else the branch with the highest seq).
    pub fn merged_highest_before(&self, id: &EventHash) -> Option<HighestBeforeSeq> {
        let mut inner = self.lock();
        match inner.merged_highest_before(id) {
            Ok(res) => res,
            Err(err) => {
                (self.crit)(&err);
                None
            }
        }
    }

    /// Raw branch-wise highest-before vector.
    pub fn highest_before(&self, id: &EventHash) -> Option<HighestBeforeSeq> {
        let mut inner = self.lock();
        inner.get_highest_before(id).unwrap_or_else(|err| {
            (self.crit)(&err);
            None
        })
    }

    /// Raw branch-wise lowest-after vector.
    pub fn lowest_after(&self, id: &EventHash) -> Option<LowestAfterSeq> {
        let mut inner = self.lock();
        inner.get_lowest_after(id).unwrap_or_else(|err| {
            (self.crit)(&err);
            None
        })
    }

    /// Global branch id assigned to an indexed event.
    pub fn branch_of(&self, id: &EventHash) -> Option<BranchId> {
        let mut inner = self.lock();
        inner.get_branch_of(id).unwrap_or_else(|err| {
            (self.crit)(&err);
            None
        })
    }

    /// Snapshot of the branches record (for inspection and tests).
    pub fn branches_info(&self) -> Option<BranchesInfo> {
        let mut inner = self.lock();
        if inner.ensure_branches().is_err() {
            return None;
        }
        inner.branches.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("vector index lock")
    }
}

impl Inner {
    /// Assign the event's global branch id, continuing an existing branch
    /// where the sequence number allows and spawning a fork branch
    /// otherwise.
    fn fill_global_branch_id(
        &mut self,
        e: &dyn Event,
        me_idx: ValidatorIdx,
    ) -> Result<BranchId, VectorError> {
        let self_parent_branch = match e.self_parent() {
            Some(sp) => Some(self.get_branch_of(&sp)?.ok_or_else(|| {
                VectorError::InconsistentStore(format!("missing branch id of self-parent {sp}"))
            })?),
            None => None,
        };

        let branches = self.branches.as_mut().expect("branches loaded");
        if !branches.is_consistent(self.validators.len()) {
            return Err(VectorError::InconsistentStore(
                "branches-info arrays disagree with the validator set".into(),
            ));
        }

        match self_parent_branch {
            None => {
                // First event of the creator, unless the slot is taken.
                if branches.branch_last_seq[me_idx as usize].0 == 0 {
                    branches.branch_last_seq[me_idx as usize] = e.seq();
                    return Ok(me_idx as BranchId);
                }
            }
            Some(sp_branch) => {
                if branches.branch_last_seq[sp_branch as usize].next() == e.seq() {
                    branches.branch_last_seq[sp_branch as usize] = e.seq();
                    return Ok(sp_branch);
                }
            }
        }

        // The sequence does not continue any known branch: equivocation.
        let id = branches.push_branch(me_idx, e.seq());
        debug!(event = %e.id(), branch = id, creator = %e.creator(), "new fork branch");
        Ok(id)
    }

    fn fill_event_vectors(&mut self, e: &dyn Event) -> Result<(), VectorError> {
        let me_idx = self
            .validator_idxs
            .get(&e.creator())
            .copied()
            .ok_or(VectorError::UnknownCreator(e.creator()))?;
        let me_branch = self.fill_global_branch_id(e, me_idx)?;
        let num_branches = self.branches.as_ref().expect("branches loaded").num_branches();

        // Pre-load parents' vectors; an absent vector means out-of-order
        // processing.
        let mut parent_vecs = Vec::with_capacity(e.parents().len());
        for p in e.parents() {
            let vec = self
                .get_highest_before(p)?
                .ok_or(VectorError::ParentMissing(*p))?;
            parent_vecs.push(vec);
        }

        let mut before = HighestBeforeSeq::new(num_branches);
        let mut after = LowestAfterSeq::new(num_branches);
        before.init_with_event(me_branch, e.seq());
        after.init_with_event(me_branch, e.seq());

        for pv in &parent_vecs {
            before.collect_from(pv, num_branches);
        }

        // Forks the parents did not observe directly.
        {
            let branches = self.branches.as_ref().expect("branches loaded");
            let n = self.validators.len();
            if branches.at_least_one_fork(n) {
                // A marker on one of a creator's branches covers all of them.
                for creator in 0..n {
                    let ids = &branches.branches_by_creator[creator];
                    if ids.len() <= 1 {
                        continue;
                    }
                    if ids.iter().any(|&b| before.is_fork_detected(b)) {
                        for &b in ids {
                            before.set_fork_detected(b);
                        }
                    }
                }
                // Two branches of one creator with overlapping observed seq
                // ranges cannot belong to a single chain.
                'creators: for creator in 0..n {
                    if before.is_fork_detected(creator as BranchId) {
                        continue;
                    }
                    let ids = &branches.branches_by_creator[creator];
                    for &a in ids {
                        for &b in ids {
                            if a == b || before.is_empty(a) || before.is_empty(b) {
                                continue;
                            }
                            if before.min_seq(a) <= before.seq(b)
                                && before.min_seq(b) <= before.seq(a)
                            {
                                for &id in ids {
                                    before.set_fork_detected(id);
                                }
                                continue 'creators;
                            }
                        }
                    }
                }
            }
        }

        self.update_lowest_after_of_ancestors(e, me_branch)?;

        self.set_highest_before(e.id(), before)?;
        self.set_lowest_after(e.id(), after)?;
        self.set_branch_of(e.id(), me_branch)?;
        Ok(())
    }

    /// Walk the ancestry of `e` (excluding `e`) and record `e` as the first
    /// observer on its branch. The walk is cut at ancestors that already
    /// have an observer on this branch: everything below them does too.
    fn update_lowest_after_of_ancestors(
        &mut self,
        e: &dyn Event,
        me_branch: BranchId,
    ) -> Result<(), VectorError> {
        let seq = e.seq();
        let mut stack: Vec<EventHash> = e.parents().to_vec();
        while let Some(curr) = stack.pop() {
            let mut lowest = self.get_lowest_after(&curr)?.ok_or_else(|| {
                VectorError::InconsistentStore(format!("missing lowest-after vector of {curr}"))
            })?;
            if lowest.visit(me_branch, seq) {
                self.set_lowest_after(curr, lowest)?;
                let ancestor = self.events.event(&curr).ok_or_else(|| {
                    VectorError::InconsistentStore(format!("ancestor event {curr} not found"))
                })?;
                stack.extend_from_slice(ancestor.parents());
            }
        }
        Ok(())
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::BranchSeq;
    use moira_kvdb::{KvStore, MemDb};
    use moira_types::test_utils::{MemEventSource, TestEvent};
    use moira_types::{Epoch, Frame, Seq, Weight};

    struct Fixture {
        events: Arc<MemEventSource>,
        db: Arc<MemDb>,
        index: VectorIndex,
        validators: Validators,
    }

    fn fixture(n: u32) -> Fixture {
        let entries: Vec<_> = (1..=n).map(|i| (ValidatorId(i), Weight(1))).collect();
        let validators = Validators::from_entries(&entries);
        let events = Arc::new(MemEventSource::new());
        let db = Arc::new(MemDb::new());
        let flushable = Arc::new(Flushable::new(Arc::clone(&db) as Arc<dyn KvStore>));
        let crit: CriticalHandler = Arc::new(|err| panic!("critical: {err}"));
        let index = VectorIndex::new(
            VectorIndexConfig::lite(),
            &validators,
            flushable,
            Arc::clone(&events) as Arc<dyn EventSource>,
            crit,
        );
        Fixture {
            events,
            db,
            index,
            validators,
        }
    }

    impl Fixture {
        /// Create, store and index an event; self-parent is the first
        /// parent when `self_parent` is set.
        fn event(
            &self,
            creator: u32,
            seq: u32,
            parents: Vec<EventHash>,
            self_parent: Option<EventHash>,
        ) -> EventHash {
            let id = self.make(creator, seq, parents, self_parent);
            self.add(&id).unwrap();
            id
        }

        fn make(
            &self,
            creator: u32,
            seq: u32,
            parents: Vec<EventHash>,
            self_parent: Option<EventHash>,
        ) -> EventHash {
            let e = TestEvent::new(
                ValidatorId(creator),
                Epoch(1),
                Seq(seq),
                Frame(1),
                parents,
                self_parent,
            );
            let id = e.id();
            self.events.insert(e);
            id
        }

        fn add(&self, id: &EventHash) -> Result<(), VectorError> {
            let e = self.events.event(id).expect("event stored");
            self.index.add(e.as_ref())
        }
    }

    #[test]
    fn test_first_event_vectors() {
        let fx = fixture(3);
        let a1 = fx.event(1, 1, vec![], None);

        let hb = fx.index.highest_before(&a1).unwrap();
        assert_eq!(hb.get(0), BranchSeq { seq: Seq(1), min_seq: Seq(1) });
        assert!(hb.is_empty(1));

        let la = fx.index.lowest_after(&a1).unwrap();
        assert_eq!(la.get(0), Seq(1));
        assert_eq!(fx.index.branch_of(&a1), Some(0));
    }

    #[test]
    fn test_parent_merge_and_lowest_after_update() {
        let fx = fixture(3);
        let a1 = fx.event(1, 1, vec![], None);
        let b1 = fx.event(2, 1, vec![], None);
        let a2 = fx.event(1, 2, vec![a1, b1], Some(a1));

        let hb = fx.index.highest_before(&a2).unwrap();
        assert_eq!(hb.get(0), BranchSeq { seq: Seq(2), min_seq: Seq(1) });
        assert_eq!(hb.get(1), BranchSeq { seq: Seq(1), min_seq: Seq(1) });

        // a2 is the first event of branch 0 observing b1.
        let la_b1 = fx.index.lowest_after(&b1).unwrap();
        assert_eq!(la_b1.get(0), Seq(2));
        assert_eq!(la_b1.get(1), Seq(1));

        // a1's own entry was recorded by a1 itself and stays.
        let la_a1 = fx.index.lowest_after(&a1).unwrap();
        assert_eq!(la_a1.get(0), Seq(1));
    }

    #[test]
    fn test_missing_parent_is_recoverable_after_drop() {
        let fx = fixture(2);
        let a1 = fx.make(1, 1, vec![], None);
        let a2 = fx.make(1, 2, vec![a1], Some(a1));

        let err = fx.add(&a2).unwrap_err();
        assert!(matches!(err, VectorError::ParentMissing(p) if p == a1));

        // The failed call staged branch mutations; roll back before
        // re-feeding in order.
        fx.index.drop_not_flushed();
        fx.add(&a1).unwrap();
        fx.add(&a2).unwrap();

        let info = fx.index.branches_info().unwrap();
        assert_eq!(info.num_branches(), 2);
        assert_eq!(info.branch_last_seq[0], Seq(2));
    }

    #[test]
    fn test_add_is_idempotent() {
        let fx = fixture(2);
        let a1 = fx.event(1, 1, vec![], None);
        fx.add(&a1).unwrap();
        fx.add(&a1).unwrap();

        let info = fx.index.branches_info().unwrap();
        assert_eq!(info.num_branches(), 2);
        assert_eq!(info.branch_last_seq[0], Seq(1));
    }

    #[test]
    fn test_duplicate_first_event_spawns_branch() {
        let fx = fixture(2);
        let b1 = fx.make(2, 1, vec![], None);
        let e = fx.events.event(&b1).unwrap();
        fx.index.add(e.as_ref()).unwrap();

        // A second seq-1 event by the same creator cannot continue any
        // branch.
        let forked = TestEvent::new(ValidatorId(2), Epoch(1), Seq(1), Frame(1), vec![], None)
            .forked(7);
        let forked_id = forked.id();
        fx.events.insert(forked);
        fx.add(&forked_id).unwrap();

        let info = fx.index.branches_info().unwrap();
        assert_eq!(info.num_branches(), 3);
        assert_eq!(info.branches_by_creator[1], vec![1, 2]);
        assert_eq!(fx.index.branch_of(&forked_id), Some(2));
    }

    #[test]
    fn test_seq_gap_spawns_branch() {
        let fx = fixture(2);
        let a1 = fx.event(1, 1, vec![], None);
        // seq 3 does not continue seq 1.
        let a3 = fx.event(1, 3, vec![a1], Some(a1));

        let info = fx.index.branches_info().unwrap();
        assert_eq!(info.num_branches(), 3);
        assert_eq!(fx.index.branch_of(&a3), Some(2));
    }

    #[test]
    fn test_observer_of_both_branches_gets_fork_marker() {
        let fx = fixture(3);
        let b1 = fx.event(2, 1, vec![], None);
        let forked = TestEvent::new(ValidatorId(2), Epoch(1), Seq(1), Frame(1), vec![], None)
            .forked(9);
        let b1_fork = forked.id();
        fx.events.insert(forked);
        fx.add(&b1_fork).unwrap();

        let c1 = fx.event(3, 1, vec![b1, b1_fork], None);

        let hb = fx.index.highest_before(&c1).unwrap();
        // Creator 2 (idx 1) owns branches 1 and 3; both carry the marker.
        assert!(hb.is_fork_detected(1));
        assert!(hb.is_fork_detected(3));

        let merged = fx.index.merged_highest_before(&c1).unwrap();
        assert!(merged.is_fork_detected(1));
        assert!(!merged.is_fork_detected(0));
    }

    #[test]
    fn test_fork_marker_sticks_in_descendants() {
        let fx = fixture(3);
        let b1 = fx.event(2, 1, vec![], None);
        let forked = TestEvent::new(ValidatorId(2), Epoch(1), Seq(1), Frame(1), vec![], None)
            .forked(9);
        let b1_fork = forked.id();
        fx.events.insert(forked);
        fx.add(&b1_fork).unwrap();

        let c1 = fx.event(3, 1, vec![b1, b1_fork], None);
        let c2 = fx.event(3, 2, vec![c1], Some(c1));
        let c3 = fx.event(3, 3, vec![c2, b1], Some(c2));

        for id in [c2, c3] {
            let hb = fx.index.highest_before(&id).unwrap();
            assert!(hb.is_fork_detected(1), "marker must be absorbing");
        }
    }

    #[test]
    fn test_forkless_cause_needs_quorum_of_observers() {
        let fx = fixture(4);
        let a1 = fx.event(1, 1, vec![], None);
        let b1 = fx.event(2, 1, vec![], None);
        let c1 = fx.event(3, 1, vec![], None);
        let d1 = fx.event(4, 1, vec![], None);

        let a2 = fx.event(1, 2, vec![a1, b1, c1], Some(a1));
        // Only a and b chains connect b1 so far: no quorum.
        assert!(!fx.index.forkless_cause(&a2, &b1));

        let b2 = fx.event(2, 2, vec![b1, a2, c1], Some(b1));
        let c2 = fx.event(3, 2, vec![c1, b2, d1], Some(c1));
        // a, b and c chains now sit above b1 and c2 observes all three.
        assert!(fx.index.forkless_cause(&c2, &b1));
        assert!(fx.index.forkless_cause(&c2, &c1));
        assert!(!fx.index.forkless_cause(&a2, &d1));
    }

    #[test]
    fn test_forkless_cause_excludes_equivocators() {
        let fx = fixture(2);
        let b1 = fx.event(2, 1, vec![], None);
        let forked = TestEvent::new(ValidatorId(2), Epoch(1), Seq(1), Frame(1), vec![], None)
            .forked(3);
        let b1_fork = forked.id();
        fx.events.insert(forked);
        fx.add(&b1_fork).unwrap();

        // a1 observes both of b's branches: b's weight must not count.
        let a1 = fx.event(1, 1, vec![b1, b1_fork], None);
        assert!(!fx.index.forkless_cause(&a1, &b1));
    }

    #[test]
    fn test_flush_persists_state_across_restart() {
        let fx = fixture(3);
        let a1 = fx.event(1, 1, vec![], None);
        let b1 = fx.event(2, 1, vec![], None);
        let a2 = fx.event(1, 2, vec![a1, b1], Some(a1));
        fx.index.flush();

        // A fresh index over the same backing store sees the flushed state.
        let flushable = Arc::new(Flushable::new(Arc::clone(&fx.db) as Arc<dyn KvStore>));
        let crit: CriticalHandler = Arc::new(|err| panic!("critical: {err}"));
        let reopened = VectorIndex::new(
            VectorIndexConfig::lite(),
            &fx.validators,
            flushable,
            Arc::clone(&fx.events) as Arc<dyn EventSource>,
            crit,
        );

        assert_eq!(
            reopened.highest_before(&a2),
            fx.index.highest_before(&a2)
        );
        assert_eq!(reopened.branches_info(), fx.index.branches_info());
        assert_eq!(reopened.branch_of(&a2), Some(0));
    }

    #[test]
    fn test_unflushed_state_is_invisible_after_drop() {
        let fx = fixture(2);
        let a1 = fx.event(1, 1, vec![], None);
        fx.index.flush();
        let a2 = fx.event(1, 2, vec![a1], Some(a1));
        assert!(fx.index.highest_before(&a2).is_some());

        fx.index.drop_not_flushed();
        assert!(fx.index.highest_before(&a2).is_none());
        assert!(fx.index.highest_before(&a1).is_some());
        // Branch bookkeeping rewound with the store.
        assert_eq!(fx.index.branches_info().unwrap().branch_last_seq[0], Seq(1));
    }
}
