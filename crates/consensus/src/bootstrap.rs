//! State restoration and genesis switching.

use std::sync::Arc;

use moira_types::{Epoch, Validators, FIRST_FRAME};

use crate::{
    Election, ForklessCauseFn, Genesis, GetFrameRootsFn, Orderer, OrdererCallbacks, OrdererError,
};

impl Orderer {
    /// Restore state from the store: reopen the current epoch, rebuild the
    /// election above the last decided frame, and replay persisted roots
    /// whose decisions were not yet delivered.
    pub fn bootstrap(&mut self, callbacks: OrdererCallbacks) -> Result<(), OrdererError> {
        if self.election.is_some() {
            return Err(OrdererError::AlreadyBootstrapped);
        }
        self.callbacks = callbacks;

        let epoch = self.store.get_epoch().map_err(|e| self.fail(e.into()))?;
        self.open_epoch(epoch).map_err(|e| self.fail(e))?;

        let validators = self.store.get_validators().map_err(|e| self.fail(e.into()))?;
        let frame_to_deliver = self
            .store
            .last_decided_frame()
            .map_err(|e| self.fail(e.into()))?
            .next();

        let forkless_cause: ForklessCauseFn = {
            let index = Arc::clone(&self.dag_index);
            Arc::new(move |a, b| index.forkless_cause(a, b))
        };
        let get_frame_roots: GetFrameRootsFn = {
            let store = Arc::clone(&self.store);
            let crit = Arc::clone(&self.crit);
            Arc::new(move |frame| match store.frame_roots(frame) {
                Ok(roots) => roots,
                Err(err) => {
                    crit(&OrdererError::Store(err));
                    Vec::new()
                }
            })
        };
        self.election = Some(Election::new(
            frame_to_deliver,
            &validators,
            forkless_cause,
            get_frame_roots,
        ));

        self.replay_persisted_roots()
    }

    /// Switch to a new genesis state (epoch and validator set), dropping
    /// all in-flight per-epoch state.
    pub fn reset(&mut self, epoch: Epoch, validators: &Validators) -> Result<(), OrdererError> {
        if self.election.is_none() {
            return Err(OrdererError::NotBootstrapped);
        }
        self.store
            .switch_genesis(&Genesis {
                epoch,
                validators: validators.clone(),
            })
            .map_err(|e| self.fail(e.into()))?;
        self.reset_epoch_store(epoch)?;
        self.election
            .as_mut()
            .expect("bootstrapped")
            .reset_epoch(FIRST_FRAME, validators);
        Ok(())
    }

    /// Open the epoch store and point the vector index at its namespace.
    pub(crate) fn open_epoch(&mut self, epoch: Epoch) -> Result<(), OrdererError> {
        self.store.open_epoch_db(epoch)?;
        let validators = self.store.get_validators()?;
        self.dag_index
            .reset_epoch(&validators, self.store.vector_db()?);
        if let Some(loaded) = self.callbacks.epoch_db_loaded.as_mut() {
            loaded(epoch);
        }
        Ok(())
    }

    /// Re-feed persisted roots of undecided frames through the fresh
    /// election, applying any decisions that become ready.
    fn replay_persisted_roots(&mut self) -> Result<(), OrdererError> {
        let mut frame = self
            .store
            .last_decided_frame()
            .map_err(|e| self.fail(e.into()))?
            .next();
        loop {
            let roots = self.store.frame_roots(frame).map_err(|e| self.fail(e.into()))?;
            if roots.is_empty() {
                return Ok(());
            }
            for root in roots {
                let decisions = self
                    .election
                    .as_mut()
                    .expect("bootstrapped")
                    .vote_and_aggregate(frame, root.validator_id, root.root_hash)
                    .map_err(|e| self.fail(e.into()))?;
                for decision in decisions {
                    if self.on_frame_decided(decision.frame, decision.atropos)? {
                        return Ok(());
                    }
                }
            }
            frame = frame.next();
        }
    }
}
