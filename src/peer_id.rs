//! # Peer Identifiers & XOR Distance
//!
//! A [`PeerId`] is a 160-bit value, canonically rendered as 40 lowercase hex
//! characters. It is generated from secure random bytes at startup and never
//! persisted across runs — it is a routing handle, not an identity.
//!
//! [`PeerId`] doubles as the input to the XOR distance metric that drives
//! eviction (§4.4) and DHT responsibility (§4.6): `d(a, b)` is `a XOR b`
//! interpreted as a big-endian 160-bit unsigned integer, smaller is closer,
//! and ties are broken by lexicographic order of the hex form.

use std::cmp::Ordering;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PEER_ID_BYTES;

/// Errors constructing a [`PeerId`] from an externally supplied string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    /// The string was not exactly 40 hex characters.
    #[error("peer id must be {expected} hex characters, got {got}")]
    WrongLength {
        /// Expected character count.
        expected: usize,
        /// Actual character count.
        got: usize,
    },
    /// The string contained non-hex characters.
    #[error("peer id contains non-hexadecimal characters")]
    NotHex,
}

/// A 160-bit peer identifier.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    /// Generate a fresh, random peer ID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a peer ID from its 40-character hex representation.
    pub fn from_hex(s: &str) -> Result<Self, PeerIdError> {
        if s.len() != PEER_ID_BYTES * 2 {
            return Err(PeerIdError::WrongLength {
                expected: PEER_ID_BYTES * 2,
                got: s.len(),
            });
        }
        let decoded = hex::decode(s).map_err(|_| PeerIdError::NotHex)?;
        let mut bytes = [0u8; PEER_ID_BYTES];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Render this peer ID as 40 lowercase hex characters.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }

    /// XOR distance to another peer ID, interpreted as a big-endian integer
    /// for ordering purposes via [`XorDistance`].
    pub fn distance(&self, other: &PeerId) -> XorDistance {
        let mut out = [0u8; PEER_ID_BYTES];
        for i in 0..PEER_ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        XorDistance(out)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The XOR distance between two [`PeerId`]s, ordered as a big-endian
/// unsigned integer so that smaller means closer.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct XorDistance([u8; PEER_ID_BYTES]);

impl Ord for XorDistance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for XorDistance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for XorDistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XorDistance({})", hex::encode(self.0))
    }
}

/// Sort `candidates` ascending by XOR distance to `origin`, breaking ties
/// lexicographically by the candidate's own hex form (spec.md §3).
pub fn sort_by_distance(origin: &PeerId, candidates: &mut [PeerId]) {
    candidates.sort_by(|a, b| {
        origin
            .distance(a)
            .cmp(&origin.distance(b))
            .then_with(|| a.cmp(b))
    });
}

/// Return the candidate in `candidates` closest to `origin`, if any, with
/// the same tie-break as [`sort_by_distance`].
pub fn closest<'a>(origin: &PeerId, candidates: impl IntoIterator<Item = &'a PeerId>) -> Option<PeerId> {
    candidates
        .into_iter()
        .min_by(|a, b| origin.distance(a).cmp(&origin.distance(b)).then_with(|| a.cmp(b)))
        .copied()
}

/// Return the candidate in `candidates` farthest from `origin`, if any.
pub fn farthest<'a>(origin: &PeerId, candidates: impl IntoIterator<Item = &'a PeerId>) -> Option<PeerId> {
    candidates
        .into_iter()
        .max_by(|a, b| origin.distance(a).cmp(&origin.distance(b)).then_with(|| a.cmp(b)))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = PeerId::generate();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        let recovered = PeerId::from_hex(&hex).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn wrong_length_rejected() {
        let err = PeerId::from_hex("deadbeef").unwrap_err();
        assert!(matches!(err, PeerIdError::WrongLength { .. }));
    }

    #[test]
    fn non_hex_rejected() {
        let bogus = "z".repeat(40);
        assert_eq!(PeerId::from_hex(&bogus).unwrap_err(), PeerIdError::NotHex);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = PeerId::generate();
        let d = id.distance(&id);
        assert_eq!(d.0, [0u8; PEER_ID_BYTES]);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_eq!(a.distance(&b).0, b.distance(&a).0);
    }

    #[test]
    fn closest_and_farthest() {
        let origin = PeerId::from_hex(&"00".repeat(20)).unwrap();
        let near = PeerId::from_hex(&format!("{}{}", "00".repeat(19), "01")).unwrap();
        let far = PeerId::from_hex(&"ff".repeat(20)).unwrap();

        let candidates = vec![far, near];
        assert_eq!(closest(&origin, &candidates), Some(near));
        assert_eq!(farthest(&origin, &candidates), Some(far));
    }

    #[test]
    fn sort_orders_ascending_by_distance() {
        let origin = PeerId::from_hex(&"00".repeat(20)).unwrap();
        let a = PeerId::from_hex(&format!("{}{}", "00".repeat(19), "02")).unwrap();
        let b = PeerId::from_hex(&format!("{}{}", "00".repeat(19), "01")).unwrap();
        let c = PeerId::from_hex(&"ff".repeat(20)).unwrap();

        let mut candidates = vec![a, c, b];
        sort_by_distance(&origin, &mut candidates);
        assert_eq!(candidates, vec![b, a, c]);
    }

    #[test]
    fn serde_roundtrip() {
        let id = PeerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let recovered: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, recovered);
    }
}
