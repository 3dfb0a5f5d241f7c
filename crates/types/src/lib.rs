//! Core types for the moira consensus engine.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Identifiers**: [`Epoch`], [`Frame`], [`Seq`], [`Lamport`], [`ValidatorId`], etc.
//! - **Event model**: [`EventHash`], the [`Event`] trait and [`EventSource`] lookup
//! - **Validator set**: [`Validators`] with stake weights and deterministic ordering
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crate, making it the foundation layer.

mod event;
mod event_hash;
mod identifiers;
mod validators;

pub use event::{Event, EventRef, EventSource};
pub use event_hash::{EventHash, HexError};
pub use identifiers::{
    BranchId, Epoch, Frame, Lamport, Seq, ValidatorId, ValidatorIdx, Weight, FIRST_EPOCH,
    FIRST_FRAME,
};
pub use validators::{Validators, ValidatorsBuilder, WeightCounter};

/// Test utilities: programmatic DAG events and an in-memory event source.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
