//! Persistence of vectors and branch records.
//!
//! Four per-epoch tables share one flushable store:
//!
//! - `S` highest-before vectors, `s` lowest-after vectors (keyed by event
//!   hash, fixed little-endian layouts)
//! - `b` event → branch id, a big-endian u32
//! - `B` branches-info, one length-prefixed record under the `"c"` key
//!
//! Reads go through the bounded LRU caches; writes stage in the flushable
//! store until [`VectorIndex::flush`](crate::VectorIndex::flush) and are
//! rolled back wholesale by
//! [`VectorIndex::drop_not_flushed`](crate::VectorIndex::drop_not_flushed).

use std::sync::Arc;

use moira_kvdb::{Flushable, KvStore, Table};
use moira_types::{BranchId, EventHash};

use crate::engine::{Inner, VectorError};
use crate::{BranchesInfo, HighestBeforeSeq, LowestAfterSeq};

/// Key of the branches-info record inside its table.
const BRANCHES_INFO_KEY: &[u8] = b"c";

pub(crate) struct Tables {
    pub(crate) highest_before: Table,
    pub(crate) lowest_after: Table,
    pub(crate) event_branch: Table,
    pub(crate) branches_info: Table,
}

impl Tables {
    pub(crate) fn open(db: Arc<Flushable>) -> Self {
        let shared: Arc<dyn KvStore> = db;
        Tables {
            highest_before: Table::new(Arc::clone(&shared), b"S"),
            lowest_after: Table::new(Arc::clone(&shared), b"s"),
            event_branch: Table::new(Arc::clone(&shared), b"b"),
            branches_info: Table::new(shared, b"B"),
        }
    }
}

impl Inner {
    pub(crate) fn ensure_branches(&mut self) -> Result<(), VectorError> {
        if self.branches.is_some() {
            return Ok(());
        }
        let loaded = match self.tables.branches_info.get(BRANCHES_INFO_KEY)? {
            Some(raw) => BranchesInfo::from_bytes(&raw).ok_or_else(|| {
                VectorError::InconsistentStore("undecodable branches-info record".into())
            })?,
            None => BranchesInfo::initial(&self.validators),
        };
        if !loaded.is_consistent(self.validators.len()) {
            return Err(VectorError::InconsistentStore(
                "branches-info arrays disagree with the validator set".into(),
            ));
        }
        self.branches = Some(loaded);
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), VectorError> {
        if let Some(branches) = &self.branches {
            self.tables
                .branches_info
                .put(BRANCHES_INFO_KEY, &branches.to_bytes())?;
        }
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn get_highest_before(
        &mut self,
        id: &EventHash,
    ) -> Result<Option<HighestBeforeSeq>, VectorError> {
        if let Some(cached) = self.highest_before_cache.get(id) {
            return Ok(Some(cached.clone()));
        }
        let Some(raw) = self.tables.highest_before.get(id.as_bytes())? else {
            return Ok(None);
        };
        let vec = HighestBeforeSeq::from_bytes(&raw).ok_or_else(|| {
            VectorError::InconsistentStore(format!("undecodable highest-before vector of {id}"))
        })?;
        self.highest_before_cache.put(*id, vec.clone());
        Ok(Some(vec))
    }

    pub(crate) fn set_highest_before(
        &mut self,
        id: EventHash,
        vec: HighestBeforeSeq,
    ) -> Result<(), VectorError> {
        self.tables.highest_before.put(id.as_bytes(), &vec.to_bytes())?;
        self.highest_before_cache.put(id, vec);
        Ok(())
    }

    pub(crate) fn get_lowest_after(
        &mut self,
        id: &EventHash,
    ) -> Result<Option<LowestAfterSeq>, VectorError> {
        if let Some(cached) = self.lowest_after_cache.get(id) {
            return Ok(Some(cached.clone()));
        }
        let Some(raw) = self.tables.lowest_after.get(id.as_bytes())? else {
            return Ok(None);
        };
        let vec = LowestAfterSeq::from_bytes(&raw).ok_or_else(|| {
            VectorError::InconsistentStore(format!("undecodable lowest-after vector of {id}"))
        })?;
        self.lowest_after_cache.put(*id, vec.clone());
        Ok(Some(vec))
    }

    pub(crate) fn set_lowest_after(
        &mut self,
        id: EventHash,
        vec: LowestAfterSeq,
    ) -> Result<(), VectorError> {
        self.tables.lowest_after.put(id.as_bytes(), &vec.to_bytes())?;
        self.lowest_after_cache.put(id, vec);
        Ok(())
    }

    pub(crate) fn get_branch_of(&mut self, id: &EventHash) -> Result<Option<BranchId>, VectorError> {
        let Some(raw) = self.tables.event_branch.get(id.as_bytes())? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
            VectorError::InconsistentStore(format!("undecodable branch id of {id}"))
        })?;
        Ok(Some(BranchId::from_be_bytes(bytes)))
    }

    pub(crate) fn set_branch_of(&mut self, id: EventHash, branch: BranchId) -> Result<(), VectorError> {
        self.tables
            .event_branch
            .put(id.as_bytes(), &branch.to_be_bytes())?;
        Ok(())
    }
}
