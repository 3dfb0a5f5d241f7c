//! Frame roots and event confirmations.
//!
//! A root record's key is `frame(4) ‖ validator_id(4) ‖ event_hash(32)`,
//! all big-endian, with an empty value. Prefix scans therefore yield a
//! frame's roots in ascending `(validator, hash)` order — the stable order
//! the election's judge scan relies on. Confirmations map an event hash to
//! the frame it was finalized on.

use moira_kvdb::KvStore;
use moira_types::{EventHash, Frame, ValidatorId};

use crate::{ConsensusStore, RootDescriptor, StoreError};

const ROOT_KEY_LEN: usize = 4 + 4 + 32;

impl ConsensusStore {
    /// Record a root of `frame`.
    pub fn add_root(
        &self,
        frame: Frame,
        validator_id: ValidatorId,
        root_hash: EventHash,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let epoch = inner.epoch.as_ref().ok_or(StoreError::EpochDbClosed)?;

        let mut key = Vec::with_capacity(ROOT_KEY_LEN);
        key.extend_from_slice(&frame.to_be_bytes());
        key.extend_from_slice(&validator_id.to_be_bytes());
        key.extend_from_slice(root_hash.as_bytes());
        epoch.roots.put(&key, b"")?;

        if let Some(cached) = inner.frame_roots_cache.get_mut(&frame) {
            cached.push(RootDescriptor {
                validator_id,
                root_hash,
            });
        }
        Ok(())
    }

    /// All roots of `frame`, ascending by `(validator, hash)` key order.
    pub fn frame_roots(&self, frame: Frame) -> Result<Vec<RootDescriptor>, StoreError> {
        let mut inner = self.lock();
        if let Some(cached) = inner.frame_roots_cache.get(&frame) {
            return Ok(cached.clone());
        }
        let epoch = inner.epoch.as_ref().ok_or(StoreError::EpochDbClosed)?;

        let mut roots = Vec::new();
        for (key, _) in epoch.roots.iter_prefix(&frame.to_be_bytes(), b"")? {
            if key.len() != ROOT_KEY_LEN {
                return Err(StoreError::Inconsistent(format!(
                    "roots table: incorrect key len={}",
                    key.len()
                )));
            }
            roots.push(RootDescriptor {
                validator_id: ValidatorId::from_be_bytes(
                    key[4..8].try_into().expect("checked length"),
                ),
                root_hash: EventHash::from_bytes(&key[8..]),
            });
        }
        inner.frame_roots_cache.put(frame, roots.clone());
        Ok(roots)
    }

    /// Record the frame an event was finalized on.
    pub fn set_event_confirmed_on(
        &self,
        event: &EventHash,
        frame: Frame,
    ) -> Result<(), StoreError> {
        let inner = self.lock();
        let epoch = inner.epoch.as_ref().ok_or(StoreError::EpochDbClosed)?;
        epoch.confirmed.put(event.as_bytes(), &frame.to_be_bytes())?;
        Ok(())
    }

    /// The frame an event was finalized on; 0 when unconfirmed.
    pub fn event_confirmed_on(&self, event: &EventHash) -> Result<Frame, StoreError> {
        let inner = self.lock();
        let epoch = inner.epoch.as_ref().ok_or(StoreError::EpochDbClosed)?;
        match epoch.confirmed.get(event.as_bytes())? {
            Some(raw) => {
                let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
                    StoreError::Inconsistent(format!("undecodable confirmed-on record of {event}"))
                })?;
                Ok(Frame::from_be_bytes(bytes))
            }
            None => Ok(Frame(0)),
        }
    }
}
