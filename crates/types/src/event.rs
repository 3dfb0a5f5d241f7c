//! The DAG event model.
//!
//! Events are produced and validated upstream; the consensus core only reads
//! them. [`Event`] is the read-only view the core requires, and
//! [`EventSource`] is the injected lookup used for ancestry traversal.

use std::sync::Arc;

use crate::{Epoch, EventHash, Frame, Lamport, Seq, ValidatorId};

/// Read-only view of an admitted DAG event.
///
/// Invariants are enforced by the upstream validator before an event reaches
/// the core:
///
/// - `seq` equals the self-parent's seq + 1, or 1 without a self-parent
/// - `lamport` is strictly greater than every parent's lamport
/// - `epoch` equals the current epoch
/// - at most one parent is a self-parent (same creator, previous event)
///
/// Events are immutable once admitted.
pub trait Event: Send + Sync {
    /// Content address of this event.
    fn id(&self) -> EventHash;

    /// Validator that created this event.
    fn creator(&self) -> ValidatorId;

    /// Epoch the event belongs to.
    fn epoch(&self) -> Epoch;

    /// Per-creator sequence number (first event = 1).
    fn seq(&self) -> Seq;

    /// Frame assigned by the upstream validator.
    fn frame(&self) -> Frame;

    /// Lamport logical timestamp.
    fn lamport(&self) -> Lamport;

    /// Parent hashes, self-parent (if any) first.
    fn parents(&self) -> &[EventHash];

    /// The creator's previous event, if this is not their first.
    fn self_parent(&self) -> Option<EventHash>;
}

/// Shared handle to an event.
pub type EventRef = Arc<dyn Event>;

/// Injected event lookup.
///
/// The core never stores event bodies; it resolves hashes through this trait
/// when walking ancestry.
pub trait EventSource: Send + Sync {
    /// Resolve an event by hash.
    fn event(&self, id: &EventHash) -> Option<EventRef>;

    /// Whether an event is known.
    fn has_event(&self, id: &EventHash) -> bool {
        self.event(id).is_some()
    }
}
