//! # DHT Hash Ring
//!
//! Maps peer IDs and keys onto a 32-bit ring via SHA-256 (spec.md §4.6),
//! giving a cheap, uniformly-distributed notion of "closest peers to a
//! key" independent of the 160-bit XOR metric used for connection eviction
//! ([`crate::peer_id`]).

use sha2::{Digest, Sha256};

use crate::peer_id::PeerId;

/// Map an arbitrary string onto the ring by taking the first 4 bytes of its
/// SHA-256 digest as a big-endian `u32`.
pub fn ring_position(s: &str) -> u32 {
    let digest = Sha256::digest(s.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Circular distance between two ring positions (the shorter way around).
pub fn ring_distance(a: u32, b: u32) -> u32 {
    let diff = a.wrapping_sub(b) as u64;
    let other_way = (1u64 << 32) - diff;
    diff.min(other_way) as u32
}

/// Return the `n` entries of `peers` whose ring position is closest to
/// `key`'s, ordered nearest-first.
pub fn closest_peers(key: &str, peers: &[PeerId], n: usize) -> Vec<PeerId> {
    let key_pos = ring_position(key);
    let mut scored: Vec<(u32, PeerId)> = peers
        .iter()
        .map(|p| (ring_distance(key_pos, ring_position(&p.to_hex())), *p))
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(n).map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_position_is_deterministic() {
        assert_eq!(ring_position("global:foo"), ring_position("global:foo"));
    }

    #[test]
    fn distance_to_self_is_zero() {
        assert_eq!(ring_distance(42, 42), 0);
    }

    #[test]
    fn distance_is_symmetric() {
        assert_eq!(ring_distance(10, 20), ring_distance(20, 10));
    }

    #[test]
    fn closest_peers_returns_requested_count() {
        let peers: Vec<PeerId> = (0u8..5).map(|b| {
            PeerId::from_hex(&format!("{:02x}", b).repeat(20)).unwrap()
        }).collect();
        let closest = closest_peers("global:some-key", &peers, 3);
        assert_eq!(closest.len(), 3);
    }
}
