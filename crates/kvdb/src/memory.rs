//! In-memory reference store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Batch, BatchOp, KvError, KvResult, KvStore};

/// Ordered in-memory store over a `BTreeMap`.
///
/// The reference backend for tests and the default epoch store. `close`
/// poisons the handle so use-after-close surfaces as [`KvError::Closed`]
/// instead of silently reading stale data.
#[derive(Default)]
pub struct MemDb {
    inner: RwLock<Option<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemDb {
    pub fn new() -> Self {
        MemDb {
            inner: RwLock::new(Some(BTreeMap::new())),
        }
    }

    /// Drop all contents and reject further access.
    pub fn close(&self) {
        *self.inner.write().expect("memdb lock") = None;
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("memdb lock")
            .as_ref()
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemDb {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let guard = self.inner.read().expect("memdb lock");
        let map = guard.as_ref().ok_or(KvError::Closed)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        let mut guard = self.inner.write().expect("memdb lock");
        let map = guard.as_mut().ok_or(KvError::Closed)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        let mut guard = self.inner.write().expect("memdb lock");
        let map = guard.as_mut().ok_or(KvError::Closed)?;
        map.remove(key);
        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8], start: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.inner.read().expect("memdb lock");
        let map = guard.as_ref().ok_or(KvError::Closed)?;

        let mut from = prefix.to_vec();
        from.extend_from_slice(start);
        Ok(map
            .range(from..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(&self, batch: Batch) -> KvResult<()> {
        let mut guard = self.inner.write().expect("memdb lock");
        let map = guard.as_mut().ok_or(KvError::Closed)?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }
}
