//! Programmatic DAG construction for tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{Epoch, Event, EventHash, EventRef, EventSource, Frame, Lamport, Seq, ValidatorId};

/// Concrete [`Event`] used to build test DAGs.
#[derive(Debug, Clone)]
pub struct TestEvent {
    id: EventHash,
    creator: ValidatorId,
    epoch: Epoch,
    seq: Seq,
    frame: Frame,
    lamport: Lamport,
    parents: Vec<EventHash>,
    self_parent: Option<EventHash>,
}

impl TestEvent {
    /// Create an event and derive its hash from the header fields.
    ///
    /// `parents` must list the self-parent first when present. The Lamport
    /// timestamp is `max(parent lamports) + 1` unless overridden via
    /// [`TestEvent::with_lamport`].
    pub fn new(
        creator: ValidatorId,
        epoch: Epoch,
        seq: Seq,
        frame: Frame,
        parents: Vec<EventHash>,
        self_parent: Option<EventHash>,
    ) -> Self {
        let lamport = Lamport(
            parents
                .iter()
                .map(|p| p.lamport().0)
                .max()
                .unwrap_or(0)
                + 1,
        );
        let mut e = TestEvent {
            id: EventHash::ZERO,
            creator,
            epoch,
            seq,
            frame,
            lamport,
            parents,
            self_parent,
        };
        e.id = e.compute_id(0);
        e
    }

    /// Override the derived Lamport timestamp (re-derives the hash).
    pub fn with_lamport(mut self, lamport: Lamport) -> Self {
        self.lamport = lamport;
        self.id = self.compute_id(0);
        self
    }

    /// Re-derive the hash with a nonce, producing a distinct event with
    /// identical header fields. Used to fabricate equivocations.
    pub fn forked(mut self, nonce: u8) -> Self {
        self.id = self.compute_id(nonce);
        self
    }

    fn compute_id(&self, nonce: u8) -> EventHash {
        let mut hasher = blake3::Hasher::new_derive_key("moira.test.event.id");
        hasher.update(&self.creator.0.to_le_bytes());
        hasher.update(&self.seq.0.to_le_bytes());
        hasher.update(&self.frame.0.to_le_bytes());
        hasher.update(&[nonce]);
        for p in &self.parents {
            hasher.update(p.as_bytes());
        }
        let digest = hasher.finalize();

        let mut raw = [0u8; 32];
        raw[0..4].copy_from_slice(&self.epoch.to_be_bytes());
        raw[4..8].copy_from_slice(&self.lamport.to_be_bytes());
        raw[8..].copy_from_slice(&digest.as_bytes()[..24]);
        EventHash(raw)
    }
}

impl Event for TestEvent {
    fn id(&self) -> EventHash {
        self.id
    }

    fn creator(&self) -> ValidatorId {
        self.creator
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn seq(&self) -> Seq {
        self.seq
    }

    fn frame(&self) -> Frame {
        self.frame
    }

    fn lamport(&self) -> Lamport {
        self.lamport
    }

    fn parents(&self) -> &[EventHash] {
        &self.parents
    }

    fn self_parent(&self) -> Option<EventHash> {
        self.self_parent
    }
}

/// In-memory [`EventSource`] backed by a hash map.
#[derive(Default)]
pub struct MemEventSource {
    events: RwLock<HashMap<EventHash, EventRef>>,
}

impl MemEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an event, returning its shared handle.
    pub fn insert(&self, event: TestEvent) -> EventRef {
        let handle: EventRef = Arc::new(event);
        self.events
            .write()
            .expect("event source lock")
            .insert(handle.id(), Arc::clone(&handle));
        handle
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.read().expect("event source lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for MemEventSource {
    fn event(&self, id: &EventHash) -> Option<EventRef> {
        self.events
            .read()
            .expect("event source lock")
            .get(id)
            .cloned()
    }
}
