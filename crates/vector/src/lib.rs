//! Vector-clock indexing for the consensus DAG.
//!
//! For every admitted event the [`VectorIndex`] maintains two per-branch
//! vectors:
//!
//! - **highest-before**: the highest (and lowest) sequence number of each
//!   branch observed in the event's ancestry, with a sentinel *fork marker*
//!   once an equivocation by the branch's creator is observed
//! - **lowest-after**: the lowest sequence number of each branch's events
//!   that have this event in their past
//!
//! Together they answer the `forkless_cause(a, b)` predicate — "a observes b
//! through a supermajority of stake without observing an equivocation" —
//! which drives root election. Creators normally own a single branch;
//! equivocations spawn additional branches tracked by [`BranchesInfo`].
//!
//! All vectors are persisted through flushable tables so a failed event can
//! be rolled back with [`VectorIndex::drop_not_flushed`].

mod branches;
mod config;
mod engine;
mod forkless;
mod store;
mod vector;

pub use branches::BranchesInfo;
pub use config::VectorIndexConfig;
pub use engine::{CriticalHandler, VectorError, VectorIndex};
pub use vector::{BranchSeq, HighestBeforeSeq, LowestAfterSeq};
