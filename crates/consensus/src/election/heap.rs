//! Ordered delivery of frame decisions.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use moira_types::{EventHash, Frame};

/// A finalized frame: the elected Atropos root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AtroposDecision {
    pub frame: Frame,
    pub atropos: EventHash,
}

/// Min-heap buffering frame decisions until they form a contiguous run.
///
/// Decisions arrive out of frame order; consumers must receive them
/// gap-free. Ordered by `(frame, atropos bytes)` — the hash tie-break keeps
/// the pop order fully deterministic. The caller guarantees no two entries
/// share `(frame, atropos)`: a frame's votes are destroyed the moment it is
/// decided.
#[derive(Debug, Default)]
pub struct DeliveryBuffer {
    heap: BinaryHeap<Reverse<AtroposDecision>>,
}

impl DeliveryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, decision: AtroposDecision) {
        self.heap.push(Reverse(decision));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop the contiguous run of decisions starting exactly at
    /// `frame_to_deliver`. Later frames stay buffered until the gap closes.
    pub fn take_delivery_ready(&mut self, frame_to_deliver: Frame) -> Vec<AtroposDecision> {
        let mut delivered = Vec::new();
        let mut next = frame_to_deliver;
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.frame != next {
                break;
            }
            delivered.push(self.heap.pop().expect("peeked entry").0);
            next = next.next();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn decision(frame: u32, tag: u8) -> AtroposDecision {
        AtroposDecision {
            frame: Frame(frame),
            atropos: EventHash::from_bytes(&[tag]),
        }
    }

    #[test]
    fn test_random_push_pops_in_frame_order() {
        let mut decisions: Vec<_> = (0..100).map(|i| decision(i, i as u8)).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        decisions.shuffle(&mut rng);

        let mut buffer = DeliveryBuffer::new();
        for d in decisions {
            buffer.push(d);
        }
        let delivered = buffer.take_delivery_ready(Frame(0));
        let frames: Vec<u32> = delivered.iter().map(|d| d.frame.0).collect();
        assert_eq!(frames, (0..100).collect::<Vec<_>>());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_contiguous_run_is_delivered() {
        let mut buffer = DeliveryBuffer::new();
        for f in [100, 101, 102] {
            buffer.push(decision(f, f as u8));
        }
        let delivered = buffer.take_delivery_ready(Frame(100));
        assert_eq!(delivered.len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_nothing_delivered_before_the_target_frame() {
        let mut buffer = DeliveryBuffer::new();
        for f in [101, 102] {
            buffer.push(decision(f, f as u8));
        }
        assert!(buffer.take_delivery_ready(Frame(100)).is_empty());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_gap_splits_delivery() {
        let mut buffer = DeliveryBuffer::new();
        buffer.push(decision(100, 1));
        buffer.push(decision(101, 2));
        buffer.push(decision(104, 3));

        let delivered = buffer.take_delivery_ready(Frame(100));
        assert_eq!(
            delivered,
            vec![decision(100, 1), decision(101, 2)],
            "delivery stops at the first gap"
        );
        assert_eq!(buffer.len(), 1);

        // The run above 104 resumes once the target catches up.
        assert!(buffer.take_delivery_ready(Frame(102)).is_empty());
        assert_eq!(
            buffer.take_delivery_ready(Frame(104)),
            vec![decision(104, 3)]
        );
    }

    #[test]
    fn test_equal_frames_pop_in_hash_order() {
        let mut buffer = DeliveryBuffer::new();
        buffer.push(decision(7, 0xBB));
        buffer.push(decision(7, 0xAA));
        let delivered = buffer.take_delivery_ready(Frame(7));
        assert_eq!(delivered[0].atropos, EventHash::from_bytes(&[0xAA]));
        assert_eq!(delivered.len(), 1, "only the first of an equal-frame pair is contiguous");
    }
}
