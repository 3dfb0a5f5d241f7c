//! Global branch bookkeeping.
//!
//! Every creator owns branch id = its validator index. An event whose
//! sequence number does not continue an existing branch spawns a new branch
//! id; branches are append-only for the lifetime of an epoch.

use moira_types::{BranchId, Seq, ValidatorIdx, Validators};

/// Per-epoch record of all known branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchesInfo {
    /// branch id → highest event seq seen on the branch.
    pub branch_last_seq: Vec<Seq>,
    /// branch id → creator's validator index.
    pub branch_creator_idx: Vec<ValidatorIdx>,
    /// validator index → all branch ids of that creator.
    pub branches_by_creator: Vec<Vec<BranchId>>,
}

impl BranchesInfo {
    /// Fork-free initial state: one branch per validator, ids `0..N`.
    pub fn initial(validators: &Validators) -> Self {
        let n = validators.len();
        BranchesInfo {
            branch_last_seq: vec![Seq(0); n],
            branch_creator_idx: (0..n as ValidatorIdx).collect(),
            branches_by_creator: (0..n as BranchId).map(|i| vec![i]).collect(),
        }
    }

    /// Total number of branches (≥ validator count).
    pub fn num_branches(&self) -> usize {
        self.branch_creator_idx.len()
    }

    /// Whether any equivocation has been observed this epoch.
    pub fn at_least_one_fork(&self, num_validators: usize) -> bool {
        self.branch_creator_idx.len() > num_validators
    }

    /// Parallel-array invariant; a violation means the persisted record is
    /// corrupt.
    pub fn is_consistent(&self, num_validators: usize) -> bool {
        self.branch_last_seq.len() == self.branch_creator_idx.len()
            && self.branch_creator_idx.len() >= num_validators
            && self.branches_by_creator.len() == num_validators
    }

    /// Append a fork branch for `creator` starting at `seq`.
    pub fn push_branch(&mut self, creator: ValidatorIdx, seq: Seq) -> BranchId {
        self.branch_last_seq.push(seq);
        self.branch_creator_idx.push(creator);
        let id = (self.branch_last_seq.len() - 1) as BranchId;
        self.branches_by_creator[creator as usize].push(id);
        id
    }

    /// Length-prefixed binary codec (all integers big-endian) for the
    /// branches-info record persisted under the `"c"` key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let b = self.branch_last_seq.len();
        let mut out = Vec::with_capacity(4 + b * 8 + 4 + self.branches_by_creator.len() * 8);

        out.extend_from_slice(&(b as u32).to_be_bytes());
        for seq in &self.branch_last_seq {
            out.extend_from_slice(&seq.0.to_be_bytes());
        }
        for idx in &self.branch_creator_idx {
            out.extend_from_slice(&idx.to_be_bytes());
        }

        out.extend_from_slice(&(self.branches_by_creator.len() as u32).to_be_bytes());
        for branches in &self.branches_by_creator {
            out.extend_from_slice(&(branches.len() as u32).to_be_bytes());
            for id in branches {
                out.extend_from_slice(&id.to_be_bytes());
            }
        }
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let mut r = Reader { raw, pos: 0 };

        let b = r.u32()? as usize;
        let mut branch_last_seq = Vec::with_capacity(b);
        for _ in 0..b {
            branch_last_seq.push(Seq(r.u32()?));
        }
        let mut branch_creator_idx = Vec::with_capacity(b);
        for _ in 0..b {
            branch_creator_idx.push(r.u32()?);
        }

        let n = r.u32()? as usize;
        let mut branches_by_creator = Vec::with_capacity(n);
        for _ in 0..n {
            let len = r.u32()? as usize;
            let mut branches = Vec::with_capacity(len);
            for _ in 0..len {
                branches.push(r.u32()?);
            }
            branches_by_creator.push(branches);
        }

        if r.pos != raw.len() {
            return None;
        }
        Some(BranchesInfo {
            branch_last_seq,
            branch_creator_idx,
            branches_by_creator,
        })
    }
}

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> Option<u32> {
        let end = self.pos.checked_add(4)?;
        let chunk = self.raw.get(self.pos..end)?;
        self.pos = end;
        Some(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moira_types::{ValidatorId, Weight};

    fn validators(n: u32) -> Validators {
        let entries: Vec<_> = (1..=n).map(|i| (ValidatorId(i), Weight(1))).collect();
        Validators::from_entries(&entries)
    }

    #[test]
    fn test_initial_state() {
        let info = BranchesInfo::initial(&validators(4));
        assert_eq!(info.num_branches(), 4);
        assert!(!info.at_least_one_fork(4));
        assert!(info.is_consistent(4));
        assert_eq!(info.branches_by_creator[2], vec![2]);
        assert_eq!(info.branch_last_seq, vec![Seq(0); 4]);
    }

    #[test]
    fn test_push_branch_registers_fork() {
        let mut info = BranchesInfo::initial(&validators(3));
        let id = info.push_branch(1, Seq(5));
        assert_eq!(id, 3);
        assert!(info.at_least_one_fork(3));
        assert!(info.is_consistent(3));
        assert_eq!(info.branches_by_creator[1], vec![1, 3]);
        assert_eq!(info.branch_last_seq[3], Seq(5));
        assert_eq!(info.branch_creator_idx[3], 1);
    }

    #[test]
    fn test_branches_by_creator_matches_creator_idx() {
        let mut info = BranchesInfo::initial(&validators(3));
        info.push_branch(0, Seq(2));
        info.push_branch(2, Seq(9));
        for (creator, branches) in info.branches_by_creator.iter().enumerate() {
            for &b in branches {
                assert_eq!(info.branch_creator_idx[b as usize], creator as ValidatorIdx);
            }
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let mut info = BranchesInfo::initial(&validators(4));
        info.branch_last_seq[0] = Seq(3);
        info.push_branch(2, Seq(7));
        let decoded = BranchesInfo::from_bytes(&info.to_bytes()).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn test_codec_rejects_truncated_input() {
        let info = BranchesInfo::initial(&validators(2));
        let bytes = info.to_bytes();
        assert!(BranchesInfo::from_bytes(&bytes[..bytes.len() - 1]).is_none());
        let mut extended = bytes;
        extended.push(0);
        assert!(BranchesInfo::from_bytes(&extended).is_none());
    }
}
