//! Root election and ordered delivery for the moira aBFT core.
//!
//! The crate drives the top half of the consensus pipeline:
//!
//! ```text
//! event → Orderer → VectorIndex → (if root) Election → DeliveryBuffer → on_frame_decided
//! ```
//!
//! - [`Election`] runs the multi-round voting protocol that decides one
//!   Atropos root per frame with supermajority weight
//! - [`DeliveryBuffer`] reorders out-of-order frame decisions into a
//!   gap-free sequence
//! - [`ConsensusStore`] persists validators, decided state and frame roots
//! - [`Orderer`] accepts events, feeds roots into the election and seals
//!   epochs when the application replaces the validator set

mod bootstrap;
mod election;
mod frame_decide;
mod orderer;
mod store;
mod store_roots;

pub use election::{
    AtroposDecision, DeliveryBuffer, Election, ElectionError, ForklessCauseFn, GetFrameRootsFn,
    RootDescriptor,
};
pub use orderer::{CriticalHandler, Orderer, OrdererCallbacks, OrdererError, RootCheckFn};
pub use store::{ConsensusStore, EpochDbProducer, EpochState, Genesis, LastDecidedState, StoreError};
