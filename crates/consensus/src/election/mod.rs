//! Atropos election.
//!
//! Every root of frame F casts votes about the candidate roots of all
//! undelivered frames below F. Votes are aggregated transitively: a root
//! inherits the (normalized, stake-scaled) aggregate of the frame-(F−1)
//! roots it forkless-causes, adds its own direct observations, and the
//! aggregate is checked against the supermajority threshold
//! `Q = ⌈(4·T − 3·W_observed)/3⌉`. A candidate reaching `+Q` becomes the
//! frame's Atropos; `−Q` rejects it; anything between leaves the frame for
//! a later root to decide.

mod heap;

use std::collections::HashMap;
use std::sync::Arc;

use moira_types::{EventHash, Frame, ValidatorId, ValidatorIdx, Validators};
use tracing::{debug, info};

pub use heap::{AtroposDecision, DeliveryBuffer};

/// Injected forkless-cause predicate (from the vector index).
pub type ForklessCauseFn = Arc<dyn Fn(&EventHash, &EventHash) -> bool + Send + Sync>;

/// Injected lookup of all roots of a frame, in stable store order.
pub type GetFrameRootsFn = Arc<dyn Fn(Frame) -> Vec<RootDescriptor> + Send + Sync>;

/// A root registered for some frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootDescriptor {
    pub validator_id: ValidatorId,
    pub root_hash: EventHash,
}

/// Errors raised by the election; all of them mean the caller fed
/// inconsistent data or the engine reached an impossible state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ElectionError {
    #[error("elector {0} is not in the validator set")]
    UnknownElector(ValidatorId),

    #[error("impossible election state: {0}")]
    InternalLogic(String),
}

/// Per-root voting context.
///
/// `offset` records `frame_to_deliver` at registration time; when the
/// matrix is consumed later, rows of frames delivered in between are
/// skipped. `matrix` stays `None` for roots at or below the delivery
/// frontier.
struct RootVoteContext {
    offset: Frame,
    matrix: Option<Vec<i32>>,
}

type VoteMap = HashMap<Frame, HashMap<ValidatorId, HashMap<EventHash, RootVoteContext>>>;

/// Voting state for one epoch.
pub struct Election {
    validators: Validators,
    validator_idxs: HashMap<ValidatorId, ValidatorIdx>,

    forkless_cause: ForklessCauseFn,
    get_frame_roots: GetFrameRootsFn,

    votes: VoteMap,
    delivery_buffer: DeliveryBuffer,
    frame_to_deliver: Frame,
}

impl Election {
    pub fn new(
        frame_to_deliver: Frame,
        validators: &Validators,
        forkless_cause: ForklessCauseFn,
        get_frame_roots: GetFrameRootsFn,
    ) -> Self {
        let mut election = Election {
            validators: validators.clone(),
            validator_idxs: validators.idx_map(),
            forkless_cause,
            get_frame_roots,
            votes: VoteMap::new(),
            delivery_buffer: DeliveryBuffer::new(),
            frame_to_deliver,
        };
        election.reset_epoch(frame_to_deliver, validators);
        election
    }

    /// Drop all voting state and reseed for a new epoch.
    pub fn reset_epoch(&mut self, frame_to_deliver: Frame, validators: &Validators) {
        self.votes = VoteMap::new();
        self.delivery_buffer = DeliveryBuffer::new();
        self.frame_to_deliver = frame_to_deliver;
        self.validators = validators.clone();
        self.validator_idxs = validators.idx_map();
    }

    /// The next undelivered frame.
    pub fn frame_to_deliver(&self) -> Frame {
        self.frame_to_deliver
    }

    /// Register a new elector root, aggregate its votes, and return every
    /// frame decision that became deliverable.
    pub fn vote_and_aggregate(
        &mut self,
        frame: Frame,
        validator_id: ValidatorId,
        root_hash: EventHash,
    ) -> Result<Vec<AtroposDecision>, ElectionError> {
        self.register_elector_root(frame, validator_id, root_hash);
        if frame <= self.frame_to_deliver {
            return Ok(Vec::new());
        }
        let elector_weight = self
            .validators
            .get(validator_id)
            .ok_or(ElectionError::UnknownElector(validator_id))?
            .0 as i32;

        let n = self.validators.len();
        let aggregated_frames = frame.since(self.frame_to_deliver) as usize - 1;
        let mut aggregate: Vec<i32> = Vec::with_capacity((aggregated_frames + 1) * n);
        aggregate.resize(aggregated_frames * n, 0);
        let mut direct = vec![-1i32; n];

        let observed = self.observed_roots(&root_hash, Frame(frame.0 - 1));
        let mut observed_weight: u64 = 0;
        for root in &observed {
            let Some(idx) = self.validator_idxs.get(&root.validator_id).copied() else {
                continue;
            };
            direct[idx as usize] = 1;
            observed_weight += self.validators.weight_by_idx(idx).as_u64();

            let context = self
                .votes
                .get(&Frame(frame.0 - 1))
                .and_then(|by_validator| by_validator.get(&root.validator_id))
                .and_then(|by_hash| by_hash.get(&root.root_hash));
            if let Some(context) = context {
                if let Some(matrix) = &context.matrix {
                    // Skip rows of frames delivered since the root
                    // registered.
                    let skip = self.frame_to_deliver.since(context.offset) as usize * n;
                    for (slot, vote) in aggregate.iter_mut().zip(&matrix[skip..]) {
                        *slot += vote;
                    }
                }
            }
        }

        self.decide(frame, &aggregate, observed_weight)?;

        // The stored matrix carries opinions, not magnitudes: collapse each
        // aggregate to ±elector_weight and append the direct votes.
        let mut matrix = aggregate;
        for vote in matrix.iter_mut() {
            *vote = if *vote > 0 {
                elector_weight
            } else {
                -elector_weight
            };
        }
        matrix.extend(direct.into_iter().map(|vote| vote * elector_weight));
        self.votes
            .get_mut(&frame)
            .and_then(|by_validator| by_validator.get_mut(&validator_id))
            .and_then(|by_hash| by_hash.get_mut(&root_hash))
            .expect("registered above")
            .matrix = Some(matrix);

        let delivered = self
            .delivery_buffer
            .take_delivery_ready(self.frame_to_deliver);
        self.frame_to_deliver = Frame(self.frame_to_deliver.0 + delivered.len() as u32);
        Ok(delivered)
    }

    /// Check the aggregate against the supermajority threshold for every
    /// undelivered frame below the aggregating one.
    fn decide(
        &mut self,
        aggregating_frame: Frame,
        aggregate: &[i32],
        observed_weight: u64,
    ) -> Result<(), ElectionError> {
        // Numerator 4T − 3W exceeds 32 bits long before T does.
        let q_numerator =
            4 * self.validators.total_weight() as i64 - 3 * observed_weight as i64;
        let q = (q_numerator + 2) / 3;
        let n = self.validators.len();

        let mut frame = self.frame_to_deliver;
        while frame.0 + 1 < aggregating_frame.0 {
            // A frame already decided (and removed) or never voted on has
            // no candidates to elect.
            if self.votes.contains_key(&frame) {
                for (idx, candidate) in self.validators.sorted_ids().iter().enumerate() {
                    let offset = frame.since(self.frame_to_deliver) as usize * n + idx;
                    let tally = i64::from(aggregate[offset]);
                    if tally >= q {
                        let atropos = self.elect(frame, *candidate)?;
                        info!(%frame, %atropos, elected = %candidate, "atropos decided");
                        self.delivery_buffer.push(AtroposDecision { frame, atropos });
                        self.votes.remove(&frame);
                        break;
                    }
                    if tally > -q {
                        // Neither confirmed nor rejected: the frame stays
                        // open for a future root.
                        break;
                    }
                }
            }
            frame = frame.next();
        }
        Ok(())
    }

    /// Pick the Atropos event once its `(frame, validator)` slot has won.
    ///
    /// Unique for honest validators. Under equivocation the registered
    /// hashes are scanned against the frame+1 judges, in stable judge
    /// order with hashes byte-ordered, and the first judged candidate wins.
    fn elect(
        &self,
        frame: Frame,
        candidate_validator: ValidatorId,
    ) -> Result<EventHash, ElectionError> {
        let candidates = self
            .votes
            .get(&frame)
            .and_then(|by_validator| by_validator.get(&candidate_validator))
            .filter(|by_hash| !by_hash.is_empty())
            .ok_or_else(|| {
                ElectionError::InternalLogic(format!(
                    "no registered roots under decided slot (frame {frame}, validator {candidate_validator})"
                ))
            })?;

        let mut hashes: Vec<EventHash> = candidates.keys().copied().collect();
        hashes.sort_unstable();
        if hashes.len() == 1 {
            return Ok(hashes[0]);
        }

        for judge in (self.get_frame_roots)(frame.next()) {
            for hash in &hashes {
                if (self.forkless_cause)(&judge.root_hash, hash) {
                    return Ok(*hash);
                }
            }
        }
        // Unreachable once the threshold passed; kept total for safety.
        Ok(hashes[0])
    }

    fn observed_roots(&self, root: &EventHash, frame: Frame) -> Vec<RootDescriptor> {
        (self.get_frame_roots)(frame)
            .into_iter()
            .filter(|frame_root| (self.forkless_cause)(root, &frame_root.root_hash))
            .collect()
    }

    fn register_elector_root(&mut self, frame: Frame, validator_id: ValidatorId, root: EventHash) {
        self.votes
            .entry(frame)
            .or_default()
            .entry(validator_id)
            .or_default()
            .insert(
                root,
                RootVoteContext {
                    offset: self.frame_to_deliver,
                    matrix: None,
                },
            );
        debug!(%frame, validator = %validator_id, root = %root, "elector root registered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_types::Weight;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    /// A root slot in a synthetic election scenario: `observes` lists the
    /// previous-frame roots the oracle reports as forkless-caused.
    struct RootSlot {
        name: &'static str,
        frame: u32,
        validator: u32,
        observes: &'static [&'static str],
    }

    fn root(
        name: &'static str,
        frame: u32,
        validator: u32,
        observes: &'static [&'static str],
    ) -> RootSlot {
        RootSlot {
            name,
            frame,
            validator,
            observes,
        }
    }

    struct Scenario {
        election: Election,
        roots: Vec<(Frame, ValidatorId, EventHash)>,
        hashes: HashMap<&'static str, EventHash>,
    }

    /// Wire a scenario: the oracle answers from the explicit edge set, the
    /// frame-roots lookup from the registration order.
    fn scenario(weights: &[(u32, u32)], slots: Vec<RootSlot>) -> Scenario {
        let entries: Vec<_> = weights
            .iter()
            .map(|(id, w)| (ValidatorId(*id), Weight(*w)))
            .collect();
        let validators = Validators::from_entries(&entries);

        let mut hashes = HashMap::new();
        let mut frame_roots: HashMap<Frame, Vec<RootDescriptor>> = HashMap::new();
        let mut edges: HashSet<(EventHash, EventHash)> = HashSet::new();
        let mut roots = Vec::new();

        for slot in &slots {
            let hash = EventHash::from_bytes(slot.name.as_bytes());
            hashes.insert(slot.name, hash);
            frame_roots.entry(Frame(slot.frame)).or_default().push(RootDescriptor {
                validator_id: ValidatorId(slot.validator),
                root_hash: hash,
            });
            for observed in slot.observes {
                let observed_hash = *hashes.get(observed).expect("observed root defined earlier");
                edges.insert((hash, observed_hash));
            }
            roots.push((Frame(slot.frame), ValidatorId(slot.validator), hash));
        }

        let edges = Arc::new(edges);
        let frame_roots = Arc::new(frame_roots);
        let forkless_cause: ForklessCauseFn = {
            let edges = Arc::clone(&edges);
            Arc::new(move |a, b| edges.contains(&(*a, *b)))
        };
        let get_frame_roots: GetFrameRootsFn = {
            let frame_roots = Arc::clone(&frame_roots);
            Arc::new(move |frame| frame_roots.get(&frame).cloned().unwrap_or_default())
        };

        Scenario {
            election: Election::new(Frame(1), &validators, forkless_cause, get_frame_roots),
            roots,
            hashes,
        }
    }

    impl Scenario {
        /// Process all roots in order; returns every emitted decision.
        fn run(&mut self) -> Vec<AtroposDecision> {
            let mut decisions = Vec::new();
            for (frame, validator, hash) in self.roots.clone() {
                decisions.extend(
                    self.election
                        .vote_and_aggregate(frame, validator, hash)
                        .unwrap(),
                );
            }
            decisions
        }

        fn hash(&self, name: &str) -> EventHash {
            self.hashes[name]
        }
    }

    /// Four equal validators; every frame-2 root confirms c1 and rejects
    /// a1/b1, so the first frame-3 root settles frame 1 on c1.
    fn unanimous_c_slots() -> Vec<RootSlot> {
        vec![
            root("a1", 1, 1, &[]),
            root("b1", 1, 2, &[]),
            root("c1", 1, 3, &[]),
            root("d1", 1, 4, &[]),
            root("a2", 2, 1, &["c1", "d1"]),
            root("b2", 2, 2, &["c1", "d1"]),
            root("c2", 2, 3, &["c1", "d1"]),
            root("d2", 2, 4, &["c1", "d1"]),
            root("a3", 3, 1, &["a2", "b2", "c2", "d2"]),
        ]
    }

    #[test]
    fn test_simple_frame_decision() {
        let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], unanimous_c_slots());
        let decisions = s.run();
        assert_eq!(
            decisions,
            vec![AtroposDecision {
                frame: Frame(1),
                atropos: s.hash("c1"),
            }]
        );
        assert_eq!(s.election.frame_to_deliver(), Frame(2));
    }

    #[test]
    fn test_decision_requires_the_decisive_root() {
        // Without the frame-3 elector nothing can cross the threshold.
        let mut slots = unanimous_c_slots();
        slots.pop();
        let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], slots);
        assert!(s.run().is_empty());
        assert_eq!(s.election.frame_to_deliver(), Frame(1));
    }

    #[test]
    fn test_missing_frame_two_root_still_decides() {
        // Validator c produces no frame-2 root; the three remaining
        // electors still push c1 over the (now larger) threshold.
        let slots = vec![
            root("a1", 1, 1, &[]),
            root("b1", 1, 2, &[]),
            root("c1", 1, 3, &[]),
            root("d1", 1, 4, &[]),
            root("a2", 2, 1, &["c1", "d1"]),
            root("b2", 2, 2, &["c1", "d1"]),
            root("d2", 2, 4, &["c1", "d1"]),
            root("a3", 3, 1, &["a2", "b2", "d2"]),
        ];
        let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], slots);
        let decisions = s.run();
        assert_eq!(
            decisions,
            vec![AtroposDecision {
                frame: Frame(1),
                atropos: s.hash("c1"),
            }]
        );
    }

    #[test]
    fn test_dominant_validator_with_forks() {
        // Validator a holds a near-majority of stake and equivocated in
        // frame 1 (two registered roots), as did d. The election must both
        // decide a's slot and tie-break to the judged branch.
        let w_a = u32::MAX / 2 - 3;
        let slots = vec![
            root("a1", 1, 1, &[]),
            root("a1-fork", 1, 1, &[]),
            root("b1", 1, 2, &[]),
            root("c1", 1, 3, &[]),
            root("d1", 1, 4, &[]),
            root("d1-fork", 1, 4, &[]),
            root("a2", 2, 1, &["a1", "b1", "c1"]),
            root("b2", 2, 2, &["a1"]),
            root("c2", 2, 3, &["a1"]),
            root("d2", 2, 4, &["a1", "d1"]),
            root("b3", 3, 2, &["a2", "b2", "c2", "d2"]),
        ];
        let mut s = scenario(&[(1, w_a), (2, 1), (3, 1), (4, 1)], slots);
        let decisions = s.run();
        assert_eq!(
            decisions,
            vec![AtroposDecision {
                frame: Frame(1),
                atropos: s.hash("a1"),
            }],
            "the judged branch (a1, not the fork) must win the slot"
        );
    }

    #[test]
    fn test_split_votes_stay_undecided() {
        let slots = vec![
            root("a1", 1, 1, &[]),
            root("a1-fork", 1, 1, &[]),
            root("b1", 1, 2, &[]),
            root("b1-fork", 1, 2, &[]),
            root("c1", 1, 3, &[]),
            root("d1", 1, 4, &[]),
            root("a2", 2, 1, &["a1", "b1"]),
            root("b2", 2, 2, &["a1", "b1"]),
            root("c2", 2, 3, &["c1", "d1"]),
            root("d2", 2, 4, &["d1"]),
        ];
        let mut s = scenario(&[(1, 2), (2, 1), (3, 1), (4, 1)], slots);
        assert!(s.run().is_empty());
        assert_eq!(s.election.frame_to_deliver(), Frame(1));
    }

    #[test]
    fn test_chained_decisions_shift_matrix_offsets() {
        // Frame 1 is decided by a3 (advancing the delivery frontier), so
        // later electors' matrices carry a stale offset that must be
        // skipped when a4 aggregates them for frame 2.
        let mut slots = unanimous_c_slots();
        for (name, validator) in [("b3", 2), ("c3", 3), ("d3", 4)] {
            slots.push(root(name, 3, validator, &["a2", "b2", "c2", "d2"]));
        }
        slots.push(root("a4", 4, 1, &["a3", "b3", "c3", "d3"]));
        let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], slots);

        let decisions = s.run();
        assert_eq!(
            decisions,
            vec![
                AtroposDecision {
                    frame: Frame(1),
                    atropos: s.hash("c1"),
                },
                AtroposDecision {
                    frame: Frame(2),
                    atropos: s.hash("a2"),
                },
            ]
        );
        assert_eq!(s.election.frame_to_deliver(), Frame(3));
    }

    #[test]
    fn test_outcome_is_stable_under_same_frame_reordering() {
        // Roots of one frame are independent electors: any within-frame
        // processing order yields the same decision stream.
        let reference = {
            let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], unanimous_c_slots());
            s.run()
        };
        for seed in 0..8u64 {
            let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], unanimous_c_slots());
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut shuffled: Vec<_> = Vec::new();
            for frame in 1..=3u32 {
                let mut batch: Vec<_> = s
                    .roots
                    .iter()
                    .copied()
                    .filter(|(f, _, _)| f.0 == frame)
                    .collect();
                batch.shuffle(&mut rng);
                shuffled.extend(batch);
            }
            s.roots = shuffled;
            assert_eq!(s.run(), reference, "seed {seed}");
        }
    }

    #[test]
    fn test_threshold_math_survives_maximum_total_weight() {
        // 4T − 3W approaches 2^34: the numerator must be evaluated in
        // 64-bit space.
        let w = u32::MAX / 4;
        let slots = vec![
            root("a1", 1, 1, &[]),
            root("b1", 1, 2, &[]),
            root("c1", 1, 3, &[]),
            root("d1", 1, 4, &[]),
            root("a2", 2, 1, &["a1"]),
            root("a3", 3, 1, &["a2"]),
        ];
        let mut s = scenario(&[(1, w), (2, w), (3, w), (4, w)], slots);
        assert!(s.run().is_empty());
    }

    #[test]
    fn test_epoch_reset_clears_votes_and_frontier() {
        let mut s = scenario(&[(1, 1), (2, 1), (3, 1), (4, 1)], unanimous_c_slots());
        assert_eq!(s.run().len(), 1);

        let validators = Validators::from_entries(&[
            (ValidatorId(1), Weight(5)),
            (ValidatorId(2), Weight(5)),
        ]);
        s.election.reset_epoch(Frame(1), &validators);
        assert_eq!(s.election.frame_to_deliver(), Frame(1));
        assert!(s.election.votes.is_empty());
        assert!(s.election.delivery_buffer.is_empty());
    }
}
