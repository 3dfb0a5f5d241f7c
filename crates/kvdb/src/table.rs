//! Prefix views carving logical namespaces out of one store.

use std::sync::Arc;

use crate::{Batch, BatchOp, KvResult, KvStore};

/// A named sub-namespace of a shared store.
///
/// Every key is transparently prefixed on write and stripped on scan, so
/// several tables can share one physical store without colliding.
#[derive(Clone)]
pub struct Table {
    prefix: Vec<u8>,
    db: Arc<dyn KvStore>,
}

impl Table {
    pub fn new(db: Arc<dyn KvStore>, prefix: &[u8]) -> Self {
        Table {
            prefix: prefix.to_vec(),
            db,
        }
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(self.prefix.len() + key.len());
        k.extend_from_slice(&self.prefix);
        k.extend_from_slice(key);
        k
    }
}

impl KvStore for Table {
    fn get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        self.db.get(&self.full_key(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.db.put(&self.full_key(key), value)
    }

    fn delete(&self, key: &[u8]) -> KvResult<()> {
        self.db.delete(&self.full_key(key))
    }

    fn iter_prefix(&self, prefix: &[u8], start: &[u8]) -> KvResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let pairs = self.db.iter_prefix(&self.full_key(prefix), start)?;
        Ok(pairs
            .into_iter()
            .map(|(k, v)| (k[self.prefix.len()..].to_vec(), v))
            .collect())
    }

    fn apply(&self, batch: Batch) -> KvResult<()> {
        let mut prefixed = Batch::new();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => prefixed.put(self.full_key(&key), value),
                BatchOp::Delete { key } => prefixed.delete(self.full_key(&key)),
            }
        }
        self.db.apply(prefixed)
    }
}
