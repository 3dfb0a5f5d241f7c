//! The event orderer: top-level driver of the consensus pipeline.

use std::sync::Arc;

use moira_types::{Epoch, Event, EventHash, Frame, Validators};
use moira_vector::{VectorError, VectorIndex};
use tracing::debug;

use crate::{ConsensusStore, Election};

/// Decides whether an indexed event is a root of its frame. Frames and
/// roots are assigned by the upstream event validator; the orderer only
/// consults the verdict, after the event's vector clocks are in place.
pub type RootCheckFn = Box<dyn Fn(&dyn Event) -> bool + Send + Sync>;

/// Handler for non-recoverable failures. Expected to abort or initiate
/// shutdown; the orderer stops accepting events once it fires.
pub type CriticalHandler = Arc<dyn Fn(&OrdererError) + Send + Sync>;

/// Hooks exposed to the application.
#[derive(Default)]
pub struct OrdererCallbacks {
    /// Invoked for every finalized Atropos, in frame order. Returning a
    /// validator set seals the current epoch.
    pub apply_atropos: Option<Box<dyn FnMut(Frame, EventHash) -> Option<Validators> + Send>>,

    /// Invoked after a per-epoch store has been opened or reopened.
    pub epoch_db_loaded: Option<Box<dyn FnMut(Epoch) + Send>>,
}

/// Errors surfaced by the orderer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrdererError {
    #[error("orderer is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("orderer is not bootstrapped")]
    NotBootstrapped,

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Election(#[from] crate::ElectionError),

    #[error(transparent)]
    Store(#[from] crate::StoreError),
}

impl OrdererError {
    /// Whether the failure invalidates the current epoch state, as opposed
    /// to a recoverable caller-contract violation.
    fn is_critical(&self) -> bool {
        match self {
            OrdererError::AlreadyBootstrapped | OrdererError::NotBootstrapped => false,
            OrdererError::Vector(err) => !matches!(
                err,
                VectorError::ParentMissing(_) | VectorError::UnknownCreator(_)
            ),
            OrdererError::Election(_) => true,
            OrdererError::Store(_) => true,
        }
    }
}

/// Accepts events in topological order, indexes them, feeds roots to the
/// election and drives frame-decided callbacks, sealing epochs when the
/// application replaces the validator set.
pub struct Orderer {
    pub(crate) store: Arc<ConsensusStore>,
    pub(crate) dag_index: Arc<VectorIndex>,
    pub(crate) root_check: RootCheckFn,
    pub(crate) crit: CriticalHandler,

    pub(crate) callbacks: OrdererCallbacks,
    pub(crate) election: Option<Election>,
}

impl Orderer {
    pub fn new(
        store: Arc<ConsensusStore>,
        dag_index: Arc<VectorIndex>,
        root_check: RootCheckFn,
        crit: CriticalHandler,
    ) -> Self {
        Orderer {
            store,
            dag_index,
            root_check,
            crit,
            callbacks: OrdererCallbacks::default(),
            election: None,
        }
    }

    /// Index one event and run the election if it is a root.
    ///
    /// Events must arrive in an order consistent with parent-before-child;
    /// a violation returns [`VectorError::ParentMissing`] after rolling the
    /// index back to its last flushed snapshot, and the event may be
    /// re-fed later.
    pub fn process(&mut self, event: &dyn Event) -> Result<(), OrdererError> {
        if self.election.is_none() {
            return Err(OrdererError::NotBootstrapped);
        }

        if let Err(err) = self.dag_index.add(event) {
            self.dag_index.drop_not_flushed();
            return Err(self.fail(err.into()));
        }

        let is_root = (self.root_check)(event);
        debug!(event = %event.id(), frame = %event.frame(), is_root, "event indexed");
        if is_root {
            self.store
                .add_root(event.frame(), event.creator(), event.id())
                .map_err(|e| self.fail(e.into()))?;
            let decisions = self
                .election
                .as_mut()
                .expect("bootstrapped")
                .vote_and_aggregate(event.frame(), event.creator(), event.id())
                .map_err(|e| self.fail(e.into()))?;
            for decision in decisions {
                if self.on_frame_decided(decision.frame, decision.atropos)? {
                    // The epoch was sealed; decisions of the dead epoch
                    // are void.
                    break;
                }
            }
        }

        self.dag_index.flush();
        self.store.flush().map_err(|e| self.fail(e.into()))?;
        Ok(())
    }

    /// Route critical failures to the handler before returning them.
    pub(crate) fn fail(&self, err: OrdererError) -> OrdererError {
        if err.is_critical() {
            (self.crit)(&err);
        }
        err
    }
}
