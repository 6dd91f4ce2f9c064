//! # Gossip Message Envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{GOSSIP_BROADCAST_TTL, GOSSIP_DIRECT_TTL};
use crate::peer_id::PeerId;

/// A gossiped application message: broadcast to the whole mesh when `to` is
/// `None`, or routed toward a single peer when set (spec.md §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Unique message ID, used for seen-cache dedup.
    pub id: String,
    /// The message's original sender (not necessarily the immediate hop).
    pub from: PeerId,
    /// Destination peer, if this is a directed message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    /// Application-defined subtype, opaque to the core.
    pub subtype: String,
    /// Application payload, opaque to the core.
    pub content: Value,
    /// When the message originated.
    pub timestamp: DateTime<Utc>,
    /// Remaining hop budget. Decremented on every forward; dropped at zero.
    pub ttl: u8,
    /// Peer IDs this message has already passed through, for loop
    /// suppression independent of the seen-message cache.
    pub path: Vec<PeerId>,
}

impl GossipMessage {
    /// Build a new broadcast message originating from `from`.
    pub fn new_broadcast(from: PeerId, subtype: impl Into<String>, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from,
            to: None,
            subtype: subtype.into(),
            content,
            timestamp: Utc::now(),
            ttl: GOSSIP_BROADCAST_TTL,
            path: vec![from],
        }
    }

    /// Build a new directed message from `from` toward `to`.
    pub fn new_direct(from: PeerId, to: PeerId, subtype: impl Into<String>, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from,
            to: Some(to),
            subtype: subtype.into(),
            content,
            timestamp: Utc::now(),
            ttl: GOSSIP_DIRECT_TTL,
            path: vec![from],
        }
    }

    /// `true` for a broadcast (untargeted) message.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// `true` if this message is addressed to `peer`, or is a broadcast
    /// (everyone is a recipient of a broadcast).
    pub fn is_for(&self, peer: &PeerId) -> bool {
        match &self.to {
            Some(target) => target == peer,
            None => true,
        }
    }

    /// Produce the next hop of this message: decrements TTL and appends
    /// `hop` to the path. Returns `None` if the TTL has been exhausted.
    pub fn next_hop(&self, hop: PeerId) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        let mut next = self.clone();
        next.ttl -= 1;
        next.path.push(hop);
        Some(next)
    }

    /// `true` if `peer` already appears in this message's path (loop
    /// suppression independent of the seen-message cache).
    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.path.contains(peer)
    }
}
