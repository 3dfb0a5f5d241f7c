//! Write staging with explicit flush and rollback.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{Batch, BatchOp, KvResult, KvStore};

/// Staging wrapper over an inner store.
///
/// Writes accumulate in memory until [`Flushable::flush`] pushes them to the
/// inner store as one batch; [`Flushable::drop_not_flushed`] discards them,
/// returning every reader to the last flushed snapshot. The engine stages
/// all effects of processing one event and drops them if the event fails.
///
/// Reads and scans observe staged writes (`None` entries are tombstones
/// shadowing inner pairs).
pub struct Flushable {
    inner: Arc<dyn KvStore>,
    staged: Mutex<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl Flushable {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Flushable {
            inner,
            staged: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of staged, not yet flushed pairs.
    pub fn not_flushed_pairs(&self) -> usize {
        self.staged.lock().expect("flushable lock").len()
    }

    /// Push all staged pairs to the inner store as one batch.
    pub fn flush(&self) -> KvResult<()> {
        let mut staged = self.staged.lock().expect("flushable lock");
        if staged.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new();
        for (key, value) in staged.iter() {
            match value {
                Some(v) => batch.put(key.clone(), v.clone()),
                None => batch.delete(key.clone()),
            }
        }
        self.inner.apply(batch)?;
        staged.clear();
        Ok(())
    }

    /// Discard every staged pair.
    pub fn drop_not_flushed(&self) {
        self.staged.lock().expect("flushable lock").clear();
    }
}

impl KvStore for Flushable {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.lock().expect("flushable lock").get(key) {
            return Ok(staged.clone());
        }
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.staged
            .lock()
            .expect("flushable lock")
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.staged
            .lock()
            .expect("flushable lock")
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8], start: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        // Overlay staged pairs onto the inner scan.
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.inner.iter_prefix(prefix, start)?.into_iter().collect();

        let mut from = prefix.to_vec();
        from.extend_from_slice(start);
        let staged = self.staged.lock().expect("flushable lock");
        for (key, value) in staged.range(from..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn apply(&self, batch: Batch) -> KvResult<()> {
        let mut staged = self.staged.lock().expect("flushable lock");
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    staged.insert(key, Some(value));
                }
                BatchOp::Delete { key } => {
                    staged.insert(key, None);
                }
            }
        }
        Ok(())
    }
}
