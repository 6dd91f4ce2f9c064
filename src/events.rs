//! # Mesh Events
//!
//! Per spec.md §9 ("Dynamic dispatch ... becomes tagged sum types of events
//! and a central dispatcher"), every observable surfaced to the host is a
//! variant of [`MeshEvent`] rather than a named callback. The host drains
//! these from [`crate::Mesh::events`].

use serde::{Deserialize, Serialize};

use crate::peer_id::PeerId;

/// A single observable emitted by the mesh core (spec.md §6, "Observable
/// events surfaced to the host").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MeshEvent {
    /// The mesh has finished constructing its components and is ready to
    /// connect to a signaling relay.
    Initialized {
        /// This mesh's own peer ID.
        local_peer_id: PeerId,
    },
    /// The signaling relay connection is established and announced.
    Connected,
    /// The signaling relay connection was lost or deliberately closed.
    Disconnected {
        /// Human-readable reason, for logging/diagnostics only.
        reason: String,
    },
    /// A new peer was learned about via the signaling relay.
    PeerDiscovered {
        /// The discovered peer's ID.
        peer_id: PeerId,
    },
    /// A direct peer connection reached the `connected` state.
    PeerConnected {
        /// The peer now connected.
        peer_id: PeerId,
    },
    /// A direct peer connection was torn down.
    PeerDisconnected {
        /// The peer that disconnected.
        peer_id: PeerId,
        /// Why the connection ended.
        reason: String,
    },
    /// A peer was evicted from the slot set to make room for a better one.
    PeerEvicted {
        /// The evicted peer.
        peer_id: PeerId,
        /// The eviction reason sent to the victim.
        reason: String,
    },
    /// An application-level message arrived, either delivered locally by
    /// gossip or routed directly by the connection manager.
    MessageReceived {
        /// Who the message is (nominally) from. For gossip this is the
        /// message's origin, not necessarily the immediate hop.
        from: PeerId,
        /// Message subtype, opaque to the core.
        subtype: String,
        /// Message payload, opaque to the core.
        content: serde_json::Value,
    },
    /// A DHT value changed as a result of a local put or an incoming store.
    DhtValueChanged {
        /// The namespaced key that changed.
        key: String,
        /// The new value, or `None` if the record was swept/expired.
        value: Option<serde_json::Value>,
    },
    /// A coarse-grained status summary changed (peer counts, relay state).
    StatusChanged {
        /// Number of currently connected peers.
        connected_peers: usize,
        /// Number of peers known to discovery but not yet connected.
        discovered_peers: usize,
    },
}
