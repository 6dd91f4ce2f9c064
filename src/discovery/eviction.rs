//! # Eviction Policy
//!
//! Chooses which connected peer to drop when a better candidate shows up
//! and the slot set is already full (spec.md §4.4). Two selection
//! strategies, gated by `MeshConfig::xor_routing`:
//!
//! - XOR-farthest: drop whichever connected peer is farthest, by XOR
//!   distance, from this node's own ID.
//! - FIFO: drop whichever connected peer has been connected longest.
//!
//! Eviction is never blocked merely because it would temporarily leave the
//! node with one fewer connection than ideal (the "isolation-break" case):
//! a replacement handshake is expected to follow immediately, so refusing
//! to evict in order to avoid a moment of thinner connectivity would only
//! entrench a worse topology.

use std::time::Instant;

use crate::peer_id::{self, PeerId};

/// Picks eviction victims for the connection manager.
pub struct EvictionManager {
    xor_routing: bool,
}

impl EvictionManager {
    /// Build a policy using XOR-distance victim selection if `xor_routing`,
    /// otherwise FIFO.
    pub fn new(xor_routing: bool) -> Self {
        Self { xor_routing }
    }

    /// Choose a victim among `connected`, a list of `(peer_id,
    /// connected_at)` pairs, to make room for a new peer. Returns `None` if
    /// `connected` is empty.
    pub fn choose_victim(
        &self,
        local_id: &PeerId,
        connected: &[(PeerId, Instant)],
    ) -> Option<PeerId> {
        if connected.is_empty() {
            return None;
        }
        if self.xor_routing {
            let ids: Vec<PeerId> = connected.iter().map(|(id, _)| *id).collect();
            peer_id::farthest(local_id, &ids)
        } else {
            connected
                .iter()
                .max_by_key(|(_, connected_at)| connected_at.elapsed())
                .map(|(id, _)| *id)
        }
    }

    /// `true` if a candidate peer is closer (XOR) than the current eviction
    /// victim, and therefore worth evicting for. Always `true` under FIFO,
    /// since FIFO does not compare candidates by distance.
    pub fn candidate_improves_on(
        &self,
        local_id: &PeerId,
        candidate: &PeerId,
        victim: &PeerId,
    ) -> bool {
        if !self.xor_routing {
            return true;
        }
        local_id.distance(candidate) < local_id.distance(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> PeerId {
        PeerId::from_hex(&format!("{:02x}", byte).repeat(20)).unwrap()
    }

    #[test]
    fn xor_mode_picks_farthest() {
        let policy = EvictionManager::new(true);
        let local = id(0x00);
        let near = id(0x01);
        let far = id(0xff);
        let connected = vec![(near, Instant::now()), (far, Instant::now())];
        assert_eq!(policy.choose_victim(&local, &connected), Some(far));
    }

    #[test]
    fn fifo_mode_picks_oldest() {
        let policy = EvictionManager::new(false);
        let local = id(0x00);
        let older = id(0x01);
        let newer = id(0x02);
        let now = Instant::now();
        let connected = vec![
            (newer, now),
            (older, now - std::time::Duration::from_secs(60)),
        ];
        assert_eq!(policy.choose_victim(&local, &connected), Some(older));
    }

    #[test]
    fn empty_connected_has_no_victim() {
        let policy = EvictionManager::new(true);
        assert_eq!(policy.choose_victim(&id(0x00), &[]), None);
    }

    #[test]
    fn fifo_candidate_always_improves() {
        let policy = EvictionManager::new(false);
        assert!(policy.candidate_improves_on(&id(0x00), &id(0xff), &id(0x01)));
    }
}
