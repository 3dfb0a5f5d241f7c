//! The storage contract consumed by the engine.

use std::sync::Arc;

/// Errors surfaced by storage backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    #[error("store is closed")]
    Closed,

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// A single write operation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered group of writes applied atomically by [`KvStore::apply`].
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Byte-keyed, byte-valued store.
///
/// Handles are internally synchronized (`&self` mutation), matching how
/// embedded database handles behave; implementations must keep keys in
/// ascending byte order for [`KvStore::iter_prefix`].
pub trait KvStore: Send + Sync {
    /// Read the value under `key`.
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>>;

    /// Write `value` under `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()>;

    /// Remove `key` (no-op when absent).
    fn delete(&self, key: &[u8]) -> KvResult<()>;

    /// Materialized ascending scan of every pair whose key starts with
    /// `prefix`, beginning at `prefix ‖ start`.
    fn iter_prefix(&self, prefix: &[u8], start: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch of writes atomically.
    fn apply(&self, batch: Batch) -> KvResult<()> {
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => self.put(&key, &value)?,
                BatchOp::Delete { key } => self.delete(&key)?,
            }
        }
        Ok(())
    }
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        (**self).put(key, value)
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        (**self).delete(key)
    }

    fn iter_prefix(&self, prefix: &[u8], start: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        (**self).iter_prefix(prefix, start)
    }

    fn apply(&self, batch: Batch) -> KvResult<()> {
        (**self).apply(batch)
    }
}
