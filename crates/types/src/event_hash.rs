//! Event identifiers.
//!
//! An [`EventHash`] is the content address of a DAG event. The first four
//! bytes carry the event's epoch and the next four its Lamport timestamp
//! (both big-endian), so ordering and epoch checks never need the event body.

use std::fmt;

use crate::{Epoch, Lamport};

/// Unique identifier of a DAG event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventHash(pub [u8; 32]);

/// Errors raised when parsing an [`EventHash`] from hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("expected 32 bytes, got {0}")]
    WrongLength(usize),
}

impl EventHash {
    /// Hash of the virtual initial event.
    pub const ZERO: EventHash = EventHash([0u8; 32]);

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Epoch encoded in bytes `[0..4]`.
    pub fn epoch(&self) -> Epoch {
        Epoch(u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]))
    }

    /// Lamport timestamp encoded in bytes `[4..8]`.
    pub fn lamport(&self) -> Lamport {
        Lamport(u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]))
    }

    /// Build from raw bytes. If `raw` is shorter than 32 bytes it is
    /// left-padded with zeros; longer input is cropped from the left.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut h = [0u8; 32];
        if raw.len() >= 32 {
            h.copy_from_slice(&raw[raw.len() - 32..]);
        } else {
            h[32 - raw.len()..].copy_from_slice(raw);
        }
        EventHash(h)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| HexError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(HexError::WrongLength(bytes.len()));
        }
        let mut h = [0u8; 32];
        h.copy_from_slice(&bytes);
        Ok(EventHash(h))
    }

    /// Full lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// The epoch and Lamport prefixes carry the information humans want in logs;
// the digest is truncated to its tail.
impl fmt::Display for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.epoch(),
            self.lamport(),
            hex::encode(&self.0[26..])
        )
    }
}

impl fmt::Debug for EventHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_lamport_prefix() {
        let mut raw = [0u8; 32];
        raw[0..4].copy_from_slice(&7u32.to_be_bytes());
        raw[4..8].copy_from_slice(&42u32.to_be_bytes());
        let h = EventHash(raw);
        assert_eq!(h.epoch(), Epoch(7));
        assert_eq!(h.lamport(), Lamport(42));
    }

    #[test]
    fn test_hex_round_trip() {
        let h = EventHash::from_bytes(b"some event identifier");
        let parsed = EventHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_short_input_left_pads() {
        let h = EventHash::from_bytes(&[0xAB]);
        assert_eq!(h.0[31], 0xAB);
        assert_eq!(h.0[0], 0);
    }
}
