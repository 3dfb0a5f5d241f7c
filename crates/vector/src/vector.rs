//! Branch-wise clock vectors and their on-disk codecs.

use moira_types::{BranchId, Seq};

/// Highest/lowest observed sequence numbers of one branch.
///
/// `seq` is the highest sequence observed in the ancestry, `min_seq` the
/// lowest. The distinguished [`BranchSeq::FORK_MARKER`] value records that
/// two incompatible branches of the creator were observed; it is compared by
/// exact equality and is absorbing under merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BranchSeq {
    pub seq: Seq,
    pub min_seq: Seq,
}

impl BranchSeq {
    /// Sentinel recording an observed equivocation.
    pub const FORK_MARKER: BranchSeq = BranchSeq {
        seq: Seq(0),
        min_seq: Seq(0x7FFF_FFFF),
    };

    /// Whether this entry is the fork marker.
    pub fn is_fork_detected(&self) -> bool {
        *self == Self::FORK_MARKER
    }

    /// Whether nothing of this branch was observed.
    pub fn is_empty(&self) -> bool {
        !self.is_fork_detected() && self.seq.0 == 0
    }
}

/// Per-branch highest-before vector of one event.
///
/// Entry `b` describes what the event observes of branch `b`. Missing
/// entries read as empty, so vectors created before a fork spawned new
/// branches stay valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HighestBeforeSeq(Vec<BranchSeq>);

impl HighestBeforeSeq {
    pub fn new(size: usize) -> Self {
        HighestBeforeSeq(vec![BranchSeq::default(); size])
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, branch: BranchId) -> BranchSeq {
        self.0.get(branch as usize).copied().unwrap_or_default()
    }

    pub fn set(&mut self, branch: BranchId, value: BranchSeq) {
        let i = branch as usize;
        if i >= self.0.len() {
            self.0.resize(i + 1, BranchSeq::default());
        }
        self.0[i] = value;
    }

    /// Seed the creator's own entry from the event itself.
    pub fn init_with_event(&mut self, branch: BranchId, seq: Seq) {
        self.set(
            branch,
            BranchSeq {
                seq,
                min_seq: seq,
            },
        );
    }

    pub fn is_empty(&self, branch: BranchId) -> bool {
        self.get(branch).is_empty()
    }

    pub fn is_fork_detected(&self, branch: BranchId) -> bool {
        self.get(branch).is_fork_detected()
    }

    pub fn seq(&self, branch: BranchId) -> Seq {
        self.get(branch).seq
    }

    pub fn min_seq(&self, branch: BranchId) -> Seq {
        self.get(branch).min_seq
    }

    pub fn set_fork_detected(&mut self, branch: BranchId) {
        self.set(branch, BranchSeq::FORK_MARKER);
    }

    /// Merge a parent's vector into this one, branch by branch.
    ///
    /// The fork marker absorbs: once set here it is never overwritten, and a
    /// marker on the parent's side propagates. Otherwise `seq` takes the
    /// maximum and `min_seq` the minimum of the observed ranges.
    pub fn collect_from(&mut self, other: &HighestBeforeSeq, num_branches: usize) {
        for branch in 0..num_branches as BranchId {
            let his = other.get(branch);
            if his.is_empty() {
                continue;
            }
            let mut mine = self.get(branch);
            if mine.is_fork_detected() {
                continue;
            }
            if his.is_fork_detected() {
                self.set_fork_detected(branch);
            } else {
                if mine.seq.0 == 0 || mine.min_seq > his.min_seq {
                    mine.min_seq = his.min_seq;
                    self.set(branch, mine);
                }
                if mine.seq < his.seq {
                    mine.seq = his.seq;
                    self.set(branch, mine);
                }
            }
        }
    }

    /// Collapse a creator's branches from `other` into entry `to`.
    ///
    /// A fork marker on any branch wins outright; otherwise the entry with
    /// the highest `seq` is taken.
    pub fn gather_from(&mut self, to: BranchId, other: &HighestBeforeSeq, from: &[BranchId]) {
        let mut highest = BranchSeq::default();
        for &branch in from {
            let candidate = other.get(branch);
            if candidate.is_fork_detected() {
                highest = candidate;
                break;
            }
            if candidate.seq > highest.seq {
                highest = candidate;
            }
        }
        self.set(to, highest);
    }

    /// On-disk codec: 8 bytes per entry, little-endian `(seq, min_seq)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 8);
        for entry in &self.0 {
            out.extend_from_slice(&entry.seq.0.to_le_bytes());
            out.extend_from_slice(&entry.min_seq.0.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() % 8 != 0 {
            return None;
        }
        let entries = raw
            .chunks_exact(8)
            .map(|c| BranchSeq {
                seq: Seq(u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                min_seq: Seq(u32::from_le_bytes([c[4], c[5], c[6], c[7]])),
            })
            .collect();
        Some(HighestBeforeSeq(entries))
    }
}

/// Per-branch lowest-after vector of one event.
///
/// Entry `b` is the lowest sequence number among branch `b`'s events that
/// have this event in their past; 0 means none does yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LowestAfterSeq(Vec<Seq>);

impl LowestAfterSeq {
    pub fn new(size: usize) -> Self {
        LowestAfterSeq(vec![Seq(0); size])
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, branch: BranchId) -> Seq {
        self.0.get(branch as usize).copied().unwrap_or(Seq(0))
    }

    pub fn set(&mut self, branch: BranchId, seq: Seq) {
        let i = branch as usize;
        if i >= self.0.len() {
            self.0.resize(i + 1, Seq(0));
        }
        self.0[i] = seq;
    }

    /// Seed the creator's own entry from the event itself.
    pub fn init_with_event(&mut self, branch: BranchId, seq: Seq) {
        self.set(branch, seq);
    }

    /// Record that `seq` on `branch` observes this event. Returns false if
    /// an earlier observer was already recorded (the entry is final).
    pub fn visit(&mut self, branch: BranchId, seq: Seq) -> bool {
        if self.get(branch).0 != 0 {
            return false;
        }
        self.set(branch, seq);
        true
    }

    /// On-disk codec: 4 bytes per entry, little-endian seq.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 4);
        for seq in &self.0 {
            out.extend_from_slice(&seq.0.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() % 4 != 0 {
            return None;
        }
        let entries = raw
            .chunks_exact(4)
            .map(|c| Seq(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        Some(LowestAfterSeq(entries))
    }
}
