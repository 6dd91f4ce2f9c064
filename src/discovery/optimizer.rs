//! # Connection Optimizer
//!
//! Decides *whether* and *with whom* to proactively connect (spec.md
//! §4.3-§4.4): the "lower peer ID initiates" symmetry-breaking rule (so two
//! peers that discover each other simultaneously don't both send offers),
//! an isolation override that ignores that rule when this node has zero
//! connections, and the hysteresis cadence that stops proactively topping
//! up the slot set once `max_peers` is large enough that full saturation
//! isn't worth chasing.

use crate::config::MeshConfig;
use crate::peer_id::PeerId;

/// Stateless policy object; all inputs are passed per-call so it can be
/// shared freely across tasks.
pub struct Optimizer;

impl Optimizer {
    /// `true` if this node should be the one to send the offer to
    /// `candidate`: either `local_id` sorts lower (the symmetry-breaking
    /// rule), or this node is currently isolated, in which case it always
    /// initiates regardless of ID ordering — waiting for a peer with a
    /// lower ID to notice you has no payoff if you have nobody to talk to.
    pub fn should_initiate(local_id: &PeerId, candidate: &PeerId, connected_count: usize) -> bool {
        connected_count == 0 || *local_id < *candidate
    }

    /// `true` if the optimizer should still be proactively connecting,
    /// given how many peers are already connected.
    ///
    /// At or below [`crate::config::OPTIMIZER_HYSTERESIS_THRESHOLD`] the
    /// optimizer saturates fully up to `max_peers`. Above it, the optimizer
    /// stops once `hysteresis_target` (≈70% of `max_peers`) is reached,
    /// to avoid constantly chasing the last couple of slots in a large
    /// mesh.
    pub fn needs_more_connections(config: &MeshConfig, connected_count: usize) -> bool {
        if !config.auto_discovery {
            return false;
        }
        let target = if config.saturates_fully() {
            config.max_peers
        } else {
            config.hysteresis_target().max(config.min_peers)
        };
        connected_count < target
    }

    /// Pick the next candidate to connect to from `known`, preferring
    /// whichever is closest by XOR distance when `xor_routing` is enabled,
    /// else the first not-yet-connected candidate encountered (FIFO-ish,
    /// order as discovered).
    pub fn pick_candidate(
        config: &MeshConfig,
        local_id: &PeerId,
        known: &[PeerId],
        already_connected: &[PeerId],
    ) -> Option<PeerId> {
        let eligible: Vec<PeerId> = known
            .iter()
            .filter(|p| **p != *local_id && !already_connected.contains(p))
            .copied()
            .collect();

        if config.xor_routing {
            crate::peer_id::closest(local_id, &eligible)
        } else {
            eligible.first().copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> PeerId {
        PeerId::from_hex(&format!("{:02x}", byte).repeat(20)).unwrap()
    }

    #[test]
    fn lower_id_initiates_when_not_isolated() {
        let low = id(0x01);
        let high = id(0xff);
        assert!(Optimizer::should_initiate(&low, &high, 1));
        assert!(!Optimizer::should_initiate(&high, &low, 1));
    }

    #[test]
    fn isolation_overrides_id_ordering() {
        let high = id(0xff);
        let low = id(0x01);
        assert!(Optimizer::should_initiate(&high, &low, 0));
    }

    #[test]
    fn small_mesh_saturates_fully() {
        let config = MeshConfig::new(3, 1);
        assert!(Optimizer::needs_more_connections(&config, 2));
        assert!(!Optimizer::needs_more_connections(&config, 3));
    }

    #[test]
    fn large_mesh_stops_at_hysteresis_target() {
        let config = MeshConfig::new(10, 2);
        assert!(Optimizer::needs_more_connections(&config, 6));
        assert!(!Optimizer::needs_more_connections(&config, 7));
    }

    #[test]
    fn auto_discovery_disabled_never_needs_more() {
        let mut config = MeshConfig::new(10, 2);
        config.auto_discovery = false;
        assert!(!Optimizer::needs_more_connections(&config, 0));
    }

    #[test]
    fn candidate_selection_prefers_closest_under_xor_routing() {
        let config = MeshConfig::new(5, 1);
        let local = id(0x00);
        let near = id(0x01);
        let far = id(0xff);
        let picked = Optimizer::pick_candidate(&config, &local, &[far, near], &[]);
        assert_eq!(picked, Some(near));
    }
}
