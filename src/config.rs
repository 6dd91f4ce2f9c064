//! # Mesh Configuration & Constants
//!
//! Every tunable in the mesh core lives here. The constants capture the
//! cadences and timeouts from the design: backoff schedules, handshake
//! timeouts, cleanup intervals, and DHT replication knobs. `MeshConfig` is
//! the user-facing, validated form of those same knobs.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Peer identifier
// ---------------------------------------------------------------------------

/// Length, in bytes, of a peer identifier (160 bits).
pub const PEER_ID_BYTES: usize = 20;

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Initial reconnect backoff after a non-clean signaling disconnect.
pub const SIGNALING_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling under normal (meshless) conditions.
pub const SIGNALING_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Reconnect backoff ceiling once this peer already has at least one live
/// mesh connection — losing the relay is non-urgent once meshed.
pub const SIGNALING_BACKOFF_MAX_MESHED: Duration = Duration::from_secs(5 * 60);

/// Multiplier applied to the backoff ceiling while meshed.
pub const SIGNALING_BACKOFF_MESHED_MULTIPLIER: u32 = 3;

/// Consecutive reconnect failures after which the client parks in the
/// extended backoff interval below.
pub const SIGNALING_MAX_ATTEMPTS: u32 = 10;

/// Extended backoff interval entered after `SIGNALING_MAX_ATTEMPTS` failures.
pub const SIGNALING_EXTENDED_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Keep-alive ping cadence over the signaling relay.
pub const SIGNALING_PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a `pong` before treating the relay link as dead.
pub const SIGNALING_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for an individual signaling send.
pub const SIGNALING_SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Peer connection / handshake
// ---------------------------------------------------------------------------

/// Handshake timeout when the session carries media tracks.
pub const HANDSHAKE_TIMEOUT_WITH_MEDIA: Duration = Duration::from_secs(45);

/// Handshake timeout for a data-channel-only session.
pub const HANDSHAKE_TIMEOUT_NO_MEDIA: Duration = Duration::from_secs(30);

/// Maximum per-peer connection attempts before the peer is dropped from
/// discovery until a fresh announce arrives.
pub const MAX_CONNECTION_ATTEMPTS: u32 = 3;

/// How long a slot may sit in a non-viable terminal state before the
/// periodic sweep reclaims it.
pub const STALE_SLOT_RECLAIM_AGE: Duration = Duration::from_secs(45);

/// Per-target connect cooldown under normal conditions.
pub const CONNECT_COOLDOWN: Duration = Duration::from_millis(1500);

/// Per-target connect cooldown while this peer has zero live connections —
/// shortened so isolation recovery isn't needlessly throttled.
pub const CONNECT_COOLDOWN_ISOLATED: Duration = Duration::from_millis(500);

/// Cadence of the connection manager's periodic slot-set sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// A discovered peer with no traffic for this long is considered stale and
/// removed from the discovery registry.
pub const DISCOVERY_STALE_AGE: Duration = Duration::from_secs(5 * 60);

/// Above this `maxPeers`, the optimizer stops proactively connecting once
/// 70% saturation is reached (hysteresis); at or below it, the optimizer
/// saturates fully.
pub const OPTIMIZER_HYSTERESIS_THRESHOLD: usize = 3;

/// Fraction of `maxPeers` the optimizer targets once above the hysteresis
/// threshold, expressed as a percentage.
pub const OPTIMIZER_SATURATION_PERCENT: u32 = 70;

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

/// Initial TTL for a broadcast gossip message.
pub const GOSSIP_BROADCAST_TTL: u8 = 10;

/// Initial TTL for a directed gossip message.
pub const GOSSIP_DIRECT_TTL: u8 = 5;

/// Maximum number of entries retained in the seen-message dedup cache.
pub const GOSSIP_SEEN_CACHE_CAPACITY: usize = 10_000;

/// Time horizon after which a seen-message cache entry may be evicted even
/// if the capacity has not been reached.
pub const GOSSIP_SEEN_CACHE_HORIZON: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// WebDHT
// ---------------------------------------------------------------------------

/// Base replication factor used when a record carries no `space` tag.
pub const DHT_DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Timeout for an individual `get` query fanned out to the closest peers.
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence at which the closest-peers routing cache is refreshed.
pub const DHT_ROUTING_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the sweep that drops records older than [`DHT_RECORD_MAX_AGE`].
pub const DHT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Maximum age of a DHT record before the periodic sweep drops it.
pub const DHT_RECORD_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Number of closest peers cached by the routing-table refresh.
pub const DHT_ROUTING_CACHE_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// MeshConfig
// ---------------------------------------------------------------------------

/// User-facing, validated mesh configuration.
///
/// Constructed via [`MeshConfig::new`] or [`MeshConfig::default`], both of
/// which clamp every field to its documented valid range rather than
/// trusting the caller — a misconfigured `minPeers > maxPeers` should never
/// reach the optimizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Upper bound on the connection slot set. Clamped to `[1, 50]`.
    pub max_peers: usize,
    /// Lower bound that triggers proactive connection. Clamped to
    /// `[0, max_peers - 1]`.
    pub min_peers: usize,
    /// Gate on XOR-distance/FIFO eviction (§4.4). When `false`, eviction is
    /// disabled entirely.
    pub eviction_strategy: bool,
    /// Choose XOR-distance eviction (`true`) or FIFO (`false`).
    pub xor_routing: bool,
    /// DHT / discovery namespace. Defaults to `"global"`.
    pub network_name: String,
    /// Base replication factor used for records with no `space` tag.
    pub replication_factor_base: usize,
    /// Gate on the optimizer's proactive initiation.
    pub auto_discovery: bool,
    /// Overrides the generated peer ID. Must be exactly
    /// [`PEER_ID_BYTES`] * 2 hex characters.
    pub peer_id_override: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_peers: 3,
            min_peers: 2,
            eviction_strategy: true,
            xor_routing: true,
            network_name: "global".to_string(),
            replication_factor_base: DHT_DEFAULT_REPLICATION_FACTOR,
            auto_discovery: true,
            peer_id_override: None,
        }
    }
}

impl MeshConfig {
    /// Build a config from the given fields, clamping `max_peers` and
    /// `min_peers` into their documented valid ranges.
    pub fn new(max_peers: usize, min_peers: usize) -> Self {
        let mut cfg = Self {
            max_peers,
            min_peers,
            ..Self::default()
        };
        cfg.normalize();
        cfg
    }

    /// Clamp `max_peers` to `[1, 50]` and `min_peers` to `[0, max_peers - 1]`.
    /// Called automatically by [`new`](Self::new); also safe to call after
    /// mutating fields directly.
    pub fn normalize(&mut self) {
        self.max_peers = self.max_peers.clamp(1, 50);
        let upper = self.max_peers.saturating_sub(1);
        self.min_peers = self.min_peers.min(upper);
    }

    /// `true` once `max_peers` is small enough that the optimizer saturates
    /// fully rather than stopping at the hysteresis threshold.
    pub fn saturates_fully(&self) -> bool {
        self.max_peers <= OPTIMIZER_HYSTERESIS_THRESHOLD
    }

    /// Target connected-peer count once hysteresis applies.
    pub fn hysteresis_target(&self) -> usize {
        (self.max_peers * OPTIMIZER_SATURATION_PERCENT as usize) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_self_consistent() {
        let cfg = MeshConfig::default();
        assert!(cfg.min_peers < cfg.max_peers);
    }

    #[test]
    fn max_peers_clamped_to_valid_range() {
        let cfg = MeshConfig::new(0, 0);
        assert_eq!(cfg.max_peers, 1);

        let cfg = MeshConfig::new(1000, 0);
        assert_eq!(cfg.max_peers, 50);
    }

    #[test]
    fn min_peers_clamped_below_max_peers() {
        let cfg = MeshConfig::new(3, 10);
        assert_eq!(cfg.min_peers, 2);
    }

    #[test]
    fn saturation_threshold() {
        let small = MeshConfig::new(3, 1);
        assert!(small.saturates_fully());

        let large = MeshConfig::new(10, 2);
        assert!(!large.saturates_fully());
        assert_eq!(large.hysteresis_target(), 7);
    }
}
