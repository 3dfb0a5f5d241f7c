//! Persistent consensus state.
//!
//! Two namespaces back the orderer:
//!
//! - **permanent**: epoch state (validators) and the last decided frame;
//!   survives epoch seals
//! - **per-epoch**: frame roots and event confirmations (see
//!   `store_roots.rs`), plus the `"v"` sub-namespace handed to the vector
//!   index; recreated on every seal
//!
//! All persisted records use fixed big-endian layouts so keys sort in
//! frame/validator order and scans are deterministic.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use moira_kvdb::{Flushable, KvStore, MemDb, Table};
use moira_types::{Epoch, Frame, ValidatorId, Validators, Weight, FIRST_FRAME};
use tracing::debug;

use crate::RootDescriptor;

const EPOCH_STATE_KEY: &[u8] = b"e";
const LAST_DECIDED_KEY: &[u8] = b"d";

const ROOTS_PREFIX: &[u8] = b"r";
const CONFIRMED_PREFIX: &[u8] = b"o";
const VECTOR_PREFIX: &[u8] = b"v";

const FRAME_ROOTS_CACHE: usize = 512;

/// Errors raised by the consensus store. `Inconsistent` and `Kv` are fatal
/// for the current epoch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("inconsistent store: {0}")]
    Inconsistent(String),

    #[error("genesis is already applied")]
    GenesisAlreadyApplied,

    #[error("no epoch store is open")]
    EpochDbClosed,

    #[error(transparent)]
    Kv(#[from] moira_kvdb::KvError),
}

/// Opens (or reopens) the backing store of one epoch.
pub type EpochDbProducer = Box<dyn Fn(Epoch) -> Arc<dyn KvStore> + Send + Sync>;

/// Initial state of a fresh instance.
#[derive(Debug, Clone)]
pub struct Genesis {
    pub epoch: Epoch,
    pub validators: Validators,
}

/// Values that change only on epoch seal.
#[derive(Debug, Clone)]
pub struct EpochState {
    pub epoch: Epoch,
    pub validators: Validators,
}

/// Values that change only when a frame is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastDecidedState {
    pub last_decided_frame: Frame,
}

/// Store for validators, decided state, frame roots and the per-epoch
/// vector namespace.
pub struct ConsensusStore {
    inner: Mutex<StoreInner>,
}

pub(crate) struct StoreInner {
    permanent: Arc<Flushable>,
    make_epoch_db: EpochDbProducer,
    pub(crate) epoch: Option<EpochStores>,

    epoch_state_cache: Option<EpochState>,
    last_decided_cache: Option<LastDecidedState>,
    pub(crate) frame_roots_cache: LruCache<Frame, Vec<RootDescriptor>>,
}

pub(crate) struct EpochStores {
    flushable: Arc<Flushable>,
    pub(crate) roots: Table,
    pub(crate) confirmed: Table,
    /// Namespace of the vector index, with its own staging.
    vector: Arc<Flushable>,
}

impl ConsensusStore {
    pub fn new(permanent: Arc<dyn KvStore>, make_epoch_db: EpochDbProducer) -> Self {
        ConsensusStore {
            inner: Mutex::new(StoreInner {
                permanent: Arc::new(Flushable::new(permanent)),
                make_epoch_db,
                epoch: None,
                epoch_state_cache: None,
                last_decided_cache: None,
                frame_roots_cache: LruCache::new(
                    NonZeroUsize::new(FRAME_ROOTS_CACHE).expect("nonzero cache capacity"),
                ),
            }),
        }
    }

    /// Fully in-memory store; reopening an epoch returns the same backing
    /// map, which makes restarts testable.
    pub fn in_memory() -> Self {
        let epochs: Mutex<HashMap<Epoch, Arc<MemDb>>> = Mutex::new(HashMap::new());
        let producer: EpochDbProducer = Box::new(move |epoch| {
            let mut epochs = epochs.lock().expect("epoch map lock");
            Arc::clone(epochs.entry(epoch).or_insert_with(|| Arc::new(MemDb::new())))
                as Arc<dyn KvStore>
        });
        ConsensusStore::new(Arc::new(MemDb::new()), producer)
    }

    /// Seed a fresh instance. Fails if an epoch state already exists.
    pub fn apply_genesis(&self, genesis: &Genesis) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.read_epoch_state()?.is_some() {
            return Err(StoreError::GenesisAlreadyApplied);
        }
        inner.write_epoch_state(&EpochState {
            epoch: genesis.epoch,
            validators: genesis.validators.clone(),
        })?;
        inner.write_last_decided(&LastDecidedState {
            last_decided_frame: Frame(FIRST_FRAME.0 - 1),
        })
    }

    /// Overwrite the permanent state with a new genesis (epoch switch).
    pub fn switch_genesis(&self, genesis: &Genesis) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.write_epoch_state(&EpochState {
            epoch: genesis.epoch,
            validators: genesis.validators.clone(),
        })?;
        inner.write_last_decided(&LastDecidedState {
            last_decided_frame: Frame(FIRST_FRAME.0 - 1),
        })
    }

    pub fn epoch_state(&self) -> Result<EpochState, StoreError> {
        self.lock()
            .read_epoch_state()?
            .ok_or_else(|| StoreError::Inconsistent("missing epoch state".into()))
    }

    pub fn set_epoch_state(&self, state: &EpochState) -> Result<(), StoreError> {
        self.lock().write_epoch_state(state)
    }

    pub fn last_decided_state(&self) -> Result<LastDecidedState, StoreError> {
        self.lock()
            .read_last_decided()?
            .ok_or_else(|| StoreError::Inconsistent("missing last-decided state".into()))
    }

    pub fn set_last_decided_state(&self, state: &LastDecidedState) -> Result<(), StoreError> {
        self.lock().write_last_decided(state)
    }

    pub fn get_epoch(&self) -> Result<Epoch, StoreError> {
        Ok(self.epoch_state()?.epoch)
    }

    pub fn get_validators(&self) -> Result<Validators, StoreError> {
        Ok(self.epoch_state()?.validators)
    }

    pub fn last_decided_frame(&self) -> Result<Frame, StoreError> {
        Ok(self.last_decided_state()?.last_decided_frame)
    }

    /// Open (or reopen) the backing store of `epoch`.
    pub fn open_epoch_db(&self, epoch: Epoch) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let raw = (inner.make_epoch_db)(epoch);
        // Roots and confirmations stage through the store's flushable; the
        // vector namespace carries its own staging, driven by the index.
        let flushable = Arc::new(Flushable::new(Arc::clone(&raw)));
        inner.epoch = Some(EpochStores {
            roots: Table::new(Arc::clone(&flushable) as Arc<dyn KvStore>, ROOTS_PREFIX),
            confirmed: Table::new(Arc::clone(&flushable) as Arc<dyn KvStore>, CONFIRMED_PREFIX),
            vector: Arc::new(Flushable::new(Arc::new(Table::new(raw, VECTOR_PREFIX)))),
            flushable,
        });
        inner.frame_roots_cache.clear();
        debug!(%epoch, "epoch store opened");
        Ok(())
    }

    /// Discard the current epoch's store handle.
    pub fn drop_epoch_db(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.epoch = None;
        inner.frame_roots_cache.clear();
        Ok(())
    }

    /// The vector index's namespace inside the open epoch store.
    pub fn vector_db(&self) -> Result<Arc<Flushable>, StoreError> {
        let inner = self.lock();
        let epoch = inner.epoch.as_ref().ok_or(StoreError::EpochDbClosed)?;
        Ok(Arc::clone(&epoch.vector))
    }

    /// Durably persist permanent and epoch namespaces (the vector
    /// namespace flushes through its own handle).
    pub fn flush(&self) -> Result<(), StoreError> {
        let inner = self.lock();
        inner.permanent.flush()?;
        if let Some(epoch) = &inner.epoch {
            epoch.flushable.flush()?;
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("consensus store lock")
    }
}

impl StoreInner {
    fn read_epoch_state(&mut self) -> Result<Option<EpochState>, StoreError> {
        if let Some(cached) = &self.epoch_state_cache {
            return Ok(Some(cached.clone()));
        }
        let Some(raw) = self.permanent.get(EPOCH_STATE_KEY)? else {
            return Ok(None);
        };
        let state = decode_epoch_state(&raw)
            .ok_or_else(|| StoreError::Inconsistent("undecodable epoch state".into()))?;
        self.epoch_state_cache = Some(state.clone());
        Ok(Some(state))
    }

    fn write_epoch_state(&mut self, state: &EpochState) -> Result<(), StoreError> {
        self.permanent
            .put(EPOCH_STATE_KEY, &encode_epoch_state(state))?;
        self.epoch_state_cache = Some(state.clone());
        Ok(())
    }

    fn read_last_decided(&mut self) -> Result<Option<LastDecidedState>, StoreError> {
        if let Some(cached) = self.last_decided_cache {
            return Ok(Some(cached));
        }
        let Some(raw) = self.permanent.get(LAST_DECIDED_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Inconsistent("undecodable last-decided state".into()))?;
        let state = LastDecidedState {
            last_decided_frame: Frame::from_be_bytes(bytes),
        };
        self.last_decided_cache = Some(state);
        Ok(Some(state))
    }

    fn write_last_decided(&mut self, state: &LastDecidedState) -> Result<(), StoreError> {
        self.permanent
            .put(LAST_DECIDED_KEY, &state.last_decided_frame.to_be_bytes())?;
        self.last_decided_cache = Some(*state);
        Ok(())
    }
}

/// `epoch(4) ‖ count(4) ‖ (validator_id(4) ‖ weight(4))*`, all big-endian.
fn encode_epoch_state(state: &EpochState) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + state.validators.len() * 8);
    out.extend_from_slice(&state.epoch.to_be_bytes());
    out.extend_from_slice(&(state.validators.len() as u32).to_be_bytes());
    for (id, weight) in state.validators.iter() {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&weight.0.to_be_bytes());
    }
    out
}

fn decode_epoch_state(raw: &[u8]) -> Option<EpochState> {
    if raw.len() < 8 {
        return None;
    }
    let epoch = Epoch::from_be_bytes(raw[0..4].try_into().ok()?);
    let count = u32::from_be_bytes(raw[4..8].try_into().ok()?) as usize;
    let body = &raw[8..];
    if body.len() != count * 8 {
        return None;
    }
    let entries: Vec<(ValidatorId, Weight)> = body
        .chunks_exact(8)
        .map(|chunk| {
            (
                ValidatorId(u32::from_be_bytes(chunk[0..4].try_into().expect("chunk len"))),
                Weight(u32::from_be_bytes(chunk[4..8].try_into().expect("chunk len"))),
            )
        })
        .collect();
    Some(EpochState {
        epoch,
        validators: Validators::from_entries(&entries),
    })
}
