//! Frame delivery and epoch sealing.

use moira_types::{Epoch, EventHash, Frame, Validators, FIRST_FRAME};
use tracing::info;

use crate::{LastDecidedState, Orderer, OrdererError};

impl Orderer {
    /// Deliver one finalized frame; returns true when the epoch was
    /// sealed.
    pub(crate) fn on_frame_decided(
        &mut self,
        frame: Frame,
        atropos: EventHash,
    ) -> Result<bool, OrdererError> {
        info!(%frame, %atropos, "frame decided");
        self.store
            .set_event_confirmed_on(&atropos, frame)
            .map_err(|e| self.fail(e.into()))?;

        let new_validators = match self.callbacks.apply_atropos.as_mut() {
            Some(apply) => apply(frame, atropos),
            None => None,
        };

        let sealed = match new_validators {
            Some(validators) => {
                self.seal_epoch(validators.clone())?;
                self.election
                    .as_mut()
                    .expect("bootstrapped")
                    .reset_epoch(FIRST_FRAME, &validators);
                self.store
                    .set_last_decided_state(&LastDecidedState {
                        last_decided_frame: Frame(FIRST_FRAME.0 - 1),
                    })
                    .map_err(|e| self.fail(e.into()))?;
                true
            }
            None => {
                self.store
                    .set_last_decided_state(&LastDecidedState {
                        last_decided_frame: frame,
                    })
                    .map_err(|e| self.fail(e.into()))?;
                false
            }
        };
        Ok(sealed)
    }

    fn seal_epoch(&mut self, new_validators: Validators) -> Result<(), OrdererError> {
        let mut epoch_state = self.store.epoch_state().map_err(|e| self.fail(e.into()))?;
        epoch_state.epoch = epoch_state.epoch.next();
        epoch_state.validators = new_validators;
        self.store
            .set_epoch_state(&epoch_state)
            .map_err(|e| self.fail(e.into()))?;
        info!(epoch = %epoch_state.epoch, "epoch sealed");
        self.reset_epoch_store(epoch_state.epoch)
    }

    pub(crate) fn reset_epoch_store(&mut self, new_epoch: Epoch) -> Result<(), OrdererError> {
        self.store.drop_epoch_db().map_err(|e| self.fail(e.into()))?;
        self.open_epoch(new_epoch).map_err(|e| self.fail(e))?;
        Ok(())
    }
}
