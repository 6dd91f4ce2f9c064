//! # Gossip Manager
//!
//! Epidemic broadcast and directed messaging over the direct-connection
//! mesh (spec.md §4.5): flood forwarding bounded by TTL, loop suppression
//! via the message's own hop path, and duplicate suppression via
//! [`SeenCache`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::connection::ConnectionManager;
use crate::events::MeshEvent;
use crate::gossip::message::GossipMessage;
use crate::gossip::seen_cache::SeenCache;
use crate::metrics::MeshMetrics;
use crate::peer_id::{self, PeerId};

/// Failures broadcasting or directing a gossip message (spec.md §7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GossipError {
    /// `send_direct` was called with the local peer as its own target.
    #[error("cannot send a directed gossip message to self")]
    InvalidTarget,
}

/// Drives broadcast and directed gossip across the connection manager's
/// slot set.
pub struct GossipManager {
    local_peer_id: PeerId,
    connections: Arc<ConnectionManager>,
    seen: SeenCache,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    metrics: MeshMetrics,
}

impl GossipManager {
    /// Build a gossip manager routing over `connections`.
    pub fn new(
        local_peer_id: PeerId,
        connections: Arc<ConnectionManager>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
        metrics: MeshMetrics,
    ) -> Self {
        Self {
            local_peer_id,
            connections,
            seen: SeenCache::default(),
            events_tx,
            metrics,
        }
    }

    /// Broadcast `content` under `subtype` to the whole mesh.
    pub async fn broadcast(
        &self,
        subtype: impl Into<String>,
        content: serde_json::Value,
    ) -> Result<(), GossipError> {
        let msg = GossipMessage::new_broadcast(self.local_peer_id, subtype, content);
        self.seen.check_and_insert(&msg.id);
        self.forward(&msg).await;
        Ok(())
    }

    /// Send `content` under `subtype` toward a single peer.
    pub async fn send_direct(
        &self,
        target: PeerId,
        subtype: impl Into<String>,
        content: serde_json::Value,
    ) -> Result<(), GossipError> {
        if target == self.local_peer_id {
            return Err(GossipError::InvalidTarget);
        }
        let msg = GossipMessage::new_direct(self.local_peer_id, target, subtype, content);
        self.seen.check_and_insert(&msg.id);
        self.forward(&msg).await;
        Ok(())
    }

    /// Process a raw gossip payload received from `from` over the data
    /// channel: dedup, deliver locally if addressed here, and forward
    /// onward if the TTL budget and loop-suppression path allow it.
    pub async fn handle_incoming(&self, from: PeerId, raw: &[u8]) {
        let msg: GossipMessage = match serde_json::from_slice(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed gossip payload");
                return;
            }
        };

        if !self.seen.check_and_insert(&msg.id) {
            self.metrics.gossip_dropped_total.inc();
            trace!(message_id = %msg.id, "dropping duplicate gossip message");
            return;
        }

        if msg.is_for(&self.local_peer_id) {
            self.metrics.gossip_delivered_total.inc();
            let _ = self.events_tx.send(MeshEvent::MessageReceived {
                from: msg.from,
                subtype: msg.subtype.clone(),
                content: msg.content.clone(),
            });
        }

        if msg.is_broadcast() || !msg.is_for(&self.local_peer_id) {
            if let Some(next) = msg.next_hop(self.local_peer_id) {
                self.forward(&next).await;
            } else {
                self.metrics.gossip_dropped_total.inc();
            }
        }
    }

    /// Broadcasts flood every connected neighbor not already in the path;
    /// directed messages take a single hop, toward the target directly if
    /// it is a neighbor, else toward the XOR-closest neighbor not already
    /// visited (spec.md §4.5).
    async fn forward(&self, msg: &GossipMessage) {
        match msg.to {
            None => self.flood(msg).await,
            Some(target) => self.route_directed(msg, target).await,
        }
    }

    async fn flood(&self, msg: &GossipMessage) {
        let payload = match serde_json::to_vec(msg) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };

        let mut forwarded_to_any = false;
        for peer in self.connections.connected_peer_ids().await {
            if msg.has_visited(&peer) {
                continue;
            }
            if let Some(conn) = self.connections.get(&peer) {
                if conn.send(&payload).await.is_ok() {
                    forwarded_to_any = true;
                }
            }
        }

        if forwarded_to_any {
            self.metrics.gossip_forwarded_total.inc();
        } else {
            self.metrics.gossip_dropped_total.inc();
        }
    }

    async fn route_directed(&self, msg: &GossipMessage, target: PeerId) {
        let connected = self.connections.connected_peer_ids().await;
        let next_peer = if connected.contains(&target) && !msg.has_visited(&target) {
            Some(target)
        } else {
            let candidates: Vec<PeerId> = connected.into_iter().filter(|p| !msg.has_visited(p)).collect();
            peer_id::closest(&self.local_peer_id, &candidates)
        };

        let Some(next_peer) = next_peer else {
            trace!(message_id = %msg.id, "no eligible neighbor to route directed message toward");
            self.metrics.gossip_dropped_total.inc();
            return;
        };

        let payload = match serde_json::to_vec(msg) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };

        match self.connections.get(&next_peer) {
            Some(conn) if conn.send(&payload).await.is_ok() => {
                self.metrics.gossip_forwarded_total.inc();
            }
            _ => {
                self.metrics.gossip_dropped_total.inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> GossipManager {
        use crate::transport::PeerTransportFactory;
        use async_trait::async_trait;

        struct NullFactory;
        #[async_trait]
        impl PeerTransportFactory for NullFactory {
            async fn create(
                &self,
                _local_id: PeerId,
                _remote_id: PeerId,
                _role: crate::transport::Role,
            ) -> Box<dyn crate::transport::PeerTransport> {
                let (a, _b) = crate::transport::memory::memory_pair();
                Box::new(a)
            }
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionManager::new(
            PeerId::generate(),
            5,
            Arc::new(NullFactory),
            tx.clone(),
        ));
        GossipManager::new(PeerId::generate(), connections, tx, MeshMetrics::new())
    }

    #[tokio::test]
    async fn send_direct_to_self_is_rejected() {
        let gm = manager();
        let err = gm
            .send_direct(gm.local_peer_id, "dm", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, GossipError::InvalidTarget);
    }

    #[tokio::test]
    async fn duplicate_message_is_dropped() {
        let gm = manager();
        let msg = GossipMessage::new_broadcast(PeerId::generate(), "chat", serde_json::Value::Null);
        let payload = serde_json::to_vec(&msg).unwrap();

        gm.handle_incoming(msg.from, &payload).await;
        assert_eq!(gm.seen.len(), 1);
        gm.handle_incoming(msg.from, &payload).await;
        assert_eq!(gm.seen.len(), 1);
    }

    #[tokio::test]
    async fn message_addressed_to_self_emits_event() {
        let gm = manager();
        let msg =
            GossipMessage::new_direct(PeerId::generate(), gm.local_peer_id, "dm", serde_json::Value::Null);
        let payload = serde_json::to_vec(&msg).unwrap();
        gm.handle_incoming(msg.from, &payload).await;
    }
}
