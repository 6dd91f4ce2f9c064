//! # Peer Discovery Registry
//!
//! Tracks every peer this node has learned about via the signaling relay,
//! independent of whether a direct connection exists (spec.md §4.3's
//! distinction between "discovered" and "connected"). Entries age out after
//! [`DISCOVERY_STALE_AGE`] without fresh signaling traffic.

use std::time::Instant;

use dashmap::DashMap;

use crate::config::DISCOVERY_STALE_AGE;
use crate::peer_id::PeerId;

/// A peer known via signaling, whether or not it is directly connected.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// The peer's identifier.
    pub peer_id: PeerId,
    /// When this peer was first observed.
    pub first_seen_at: Instant,
    /// When this peer was last observed (announce, offer, or any frame
    /// naming it).
    pub last_seen_at: Instant,
    /// Connection attempts made toward this peer so far.
    pub attempts: u32,
}

/// The set of currently-known peers.
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, DiscoveredPeer>,
}

impl PeerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or refresh) an observation of `peer_id`. Returns `true` if
    /// this is the first time this peer has been seen.
    pub fn observe(&self, peer_id: PeerId) -> bool {
        let now = Instant::now();
        let mut is_new = false;
        self.peers
            .entry(peer_id)
            .and_modify(|p| p.last_seen_at = now)
            .or_insert_with(|| {
                is_new = true;
                DiscoveredPeer {
                    peer_id,
                    first_seen_at: now,
                    last_seen_at: now,
                    attempts: 0,
                }
            });
        is_new
    }

    /// Increment the attempt counter for a known peer.
    pub fn record_attempt(&self, peer_id: &PeerId) {
        if let Some(mut entry) = self.peers.get_mut(peer_id) {
            entry.attempts += 1;
        }
    }

    /// Stop tracking a peer outright (e.g. it sent `goodbye`).
    pub fn remove(&self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// `true` if this peer has been observed at all.
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Every currently-known peer ID.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Number of currently-known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// `true` if no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop and return peers that have not been observed within
    /// [`DISCOVERY_STALE_AGE`].
    pub fn sweep_stale(&self) -> Vec<PeerId> {
        let mut removed = Vec::new();
        self.peers.retain(|peer_id, entry| {
            let stale = entry.last_seen_at.elapsed() > DISCOVERY_STALE_AGE;
            if stale {
                removed.push(*peer_id);
            }
            !stale
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_reports_first_sighting_once() {
        let registry = PeerRegistry::new();
        let peer = PeerId::generate();
        assert!(registry.observe(peer));
        assert!(!registry.observe(peer));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn record_attempt_increments_counter() {
        let registry = PeerRegistry::new();
        let peer = PeerId::generate();
        registry.observe(peer);
        registry.record_attempt(&peer);
        registry.record_attempt(&peer);
        assert_eq!(registry.peers.get(&peer).unwrap().attempts, 2);
    }

    #[test]
    fn remove_drops_entry() {
        let registry = PeerRegistry::new();
        let peer = PeerId::generate();
        registry.observe(peer);
        registry.remove(&peer);
        assert!(!registry.contains(&peer));
    }
}
