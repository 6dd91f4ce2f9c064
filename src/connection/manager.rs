//! # Connection Manager
//!
//! Owns the bounded slot set of direct peer connections (spec.md §4.3):
//! admission control (capacity, self-connect, duplicate, cooldown, attempt
//! budget), the periodic stale-slot sweep, and routing of inbound signaling
//! frames to the right [`PeerConnection`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{
    CONNECT_COOLDOWN, CONNECT_COOLDOWN_ISOLATED, MAX_CONNECTION_ATTEMPTS,
    STALE_SLOT_RECLAIM_AGE,
};
use crate::connection::peer_connection::{ConnectionState, PeerConnection};
use crate::events::MeshEvent;
use crate::peer_id::PeerId;
use crate::transport::{IceCandidate, PeerTransportFactory, Role, SessionDescription};

/// Failures admitting or driving a connection attempt (spec.md §7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// A connection to this peer already exists in a non-terminal state.
    #[error("already connected to peer")]
    AlreadyConnected,
    /// A handshake with this peer is already in flight.
    #[error("handshake already in flight for this peer")]
    HandshakeInFlight,
    /// The slot set is already at `max_peers`.
    #[error("connection slot set is at capacity")]
    CapacityReached,
    /// Refused an attempt to connect to ourselves.
    #[error("refusing to connect to self")]
    SelfConnect,
    /// A previous attempt to this target is still within its cooldown.
    #[error("target is in connect cooldown")]
    Cooldown,
    /// This target has exhausted its connection attempt budget.
    #[error("connection attempt budget exhausted for this peer")]
    AttemptBudgetExhausted,
    /// No such connection is tracked.
    #[error("no connection tracked for this peer")]
    NotFound,
}

struct AttemptRecord {
    count: u32,
    last_attempt: Instant,
}

/// Bounded set of direct peer connections, plus the admission-control rules
/// that keep it bounded.
pub struct ConnectionManager {
    local_peer_id: PeerId,
    max_peers: usize,
    connections: DashMap<PeerId, Arc<PeerConnection>>,
    attempts: DashMap<PeerId, AttemptRecord>,
    transport_factory: Arc<dyn PeerTransportFactory>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ConnectionManager {
    /// Build a manager bounded to `max_peers` concurrent connections.
    pub fn new(
        local_peer_id: PeerId,
        max_peers: usize,
        transport_factory: Arc<dyn PeerTransportFactory>,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            local_peer_id,
            max_peers,
            connections: DashMap::new(),
            attempts: DashMap::new(),
            transport_factory,
            events_tx,
        }
    }

    /// Number of connections currently in the `connected` state.
    pub async fn connected_count(&self) -> usize {
        self.connected_peer_ids().await.len()
    }

    /// IDs of peers currently in the `connected` state.
    pub async fn connected_peer_ids(&self) -> Vec<PeerId> {
        let mut out = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().state().await == ConnectionState::Connected {
                out.push(*entry.key());
            }
        }
        out
    }

    /// `(peer_id, connected_since)` for every peer in the `connected`
    /// state, for eviction victim selection.
    pub async fn connected_with_timestamps(&self) -> Vec<(PeerId, Instant)> {
        let mut out = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.state().await == ConnectionState::Connected {
                if let Some(since) = conn.connected_since() {
                    out.push((*entry.key(), since));
                }
            }
        }
        out
    }

    /// Total slots occupied, including in-flight handshakes.
    pub fn slot_count(&self) -> usize {
        self.connections.len()
    }

    /// `true` if a tracked connection to `peer` exists in any non-terminal
    /// state.
    pub async fn has_slot(&self, peer: &PeerId) -> bool {
        match self.connections.get(peer) {
            Some(entry) => !entry.value().state().await.is_terminal(),
            None => false,
        }
    }

    /// Check whether initiating a connection to `target` is currently
    /// permitted, without actually doing so.
    pub async fn can_initiate(&self, target: &PeerId) -> Result<(), ConnectionError> {
        if *target == self.local_peer_id {
            return Err(ConnectionError::SelfConnect);
        }
        if self.has_slot(target).await {
            return Err(ConnectionError::AlreadyConnected);
        }
        if self.slot_count() >= self.max_peers {
            return Err(ConnectionError::CapacityReached);
        }
        if let Some(record) = self.attempts.get(target) {
            if record.count >= MAX_CONNECTION_ATTEMPTS {
                return Err(ConnectionError::AttemptBudgetExhausted);
            }
            let cooldown = self.cooldown_for_current_state().await;
            if record.last_attempt.elapsed() < cooldown {
                return Err(ConnectionError::Cooldown);
            }
        }
        Ok(())
    }

    /// Initiate a handshake with `target`: allocate a slot, build the
    /// transport, and produce the local offer to send over signaling.
    pub async fn initiate(
        &self,
        target: PeerId,
    ) -> Result<SessionDescription, ConnectionError> {
        self.can_initiate(&target).await?;

        let transport = self
            .transport_factory
            .create(self.local_peer_id, target, Role::Initiator)
            .await;
        let conn = Arc::new(PeerConnection::new(target, Role::Initiator, transport));
        self.connections.insert(target, conn.clone());
        self.record_attempt(target);

        let offer = conn
            .create_offer()
            .await
            .map_err(|_| ConnectionError::HandshakeInFlight)?;
        info!(peer_id = %target, "initiated connection");
        Ok(offer)
    }

    /// Handle an inbound offer: allocate a slot as the responder and return
    /// the local answer to send back.
    pub async fn handle_offer(
        &self,
        from: PeerId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, ConnectionError> {
        if from == self.local_peer_id {
            return Err(ConnectionError::SelfConnect);
        }
        if self.has_slot(&from).await {
            return Err(ConnectionError::AlreadyConnected);
        }
        if self.slot_count() >= self.max_peers {
            return Err(ConnectionError::CapacityReached);
        }

        let transport = self
            .transport_factory
            .create(self.local_peer_id, from, Role::Responder)
            .await;
        let conn = Arc::new(PeerConnection::new(from, Role::Responder, transport));
        self.connections.insert(from, conn.clone());

        let answer = conn
            .accept_offer(offer)
            .await
            .map_err(|_| ConnectionError::HandshakeInFlight)?;
        Ok(answer)
    }

    /// Handle an inbound answer to our own offer.
    pub async fn handle_answer(
        &self,
        from: PeerId,
        answer: SessionDescription,
    ) -> Result<(), ConnectionError> {
        let conn = self
            .connections
            .get(&from)
            .map(|e| e.value().clone())
            .ok_or(ConnectionError::NotFound)?;
        conn.accept_answer(answer)
            .await
            .map_err(|_| ConnectionError::HandshakeInFlight)
    }

    /// Buffer or apply a trickled ICE candidate for an existing slot.
    pub async fn handle_ice_candidate(
        &self,
        from: PeerId,
        candidate: IceCandidate,
    ) -> Result<(), ConnectionError> {
        let conn = self
            .connections
            .get(&from)
            .map(|e| e.value().clone())
            .ok_or(ConnectionError::NotFound)?;
        conn.add_ice_candidate(candidate)
            .await
            .map_err(|_| ConnectionError::HandshakeInFlight)
    }

    /// Mark a slot connected once its data channel opens, and emit
    /// [`MeshEvent::PeerConnected`].
    pub async fn mark_connected(&self, peer: PeerId) {
        if let Some(entry) = self.connections.get(&peer) {
            entry.value().mark_connected().await;
            self.attempts.remove(&peer);
            let _ = self.events_tx.send(MeshEvent::PeerConnected { peer_id: peer });
        }
    }

    /// Fetch the live connection handle for `peer`, if tracked.
    pub fn get(&self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        self.connections.get(peer).map(|e| e.value().clone())
    }

    /// Close and remove a peer's slot, emitting [`MeshEvent::PeerDisconnected`].
    pub async fn remove(&self, peer: &PeerId, reason: &str) {
        if let Some((_, conn)) = self.connections.remove(peer) {
            conn.close().await;
            let _ = self.events_tx.send(MeshEvent::PeerDisconnected {
                peer_id: *peer,
                reason: reason.to_string(),
            });
        }
    }

    /// Evict a peer to make room for a better one (spec.md §4.4), emitting
    /// [`MeshEvent::PeerEvicted`] instead of a plain disconnect.
    pub async fn evict(&self, peer: &PeerId, reason: &str) {
        if let Some((_, conn)) = self.connections.remove(peer) {
            conn.close().await;
            let _ = self.events_tx.send(MeshEvent::PeerEvicted {
                peer_id: *peer,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop slots that have sat in a terminal state, or stuck mid-handshake,
    /// for longer than [`STALE_SLOT_RECLAIM_AGE`]. Intended to run on
    /// [`crate::config::CLEANUP_INTERVAL`].
    pub async fn sweep_stale(&self) {
        let mut stale = Vec::new();
        for entry in self.connections.iter() {
            let conn = entry.value();
            let state = conn.state().await;
            let reclaimable = state.is_terminal()
                || (state != ConnectionState::Connected && conn.age() > STALE_SLOT_RECLAIM_AGE);
            if reclaimable {
                stale.push(*entry.key());
            }
        }
        for peer in stale {
            warn!(peer_id = %peer, "reclaiming stale connection slot");
            self.remove(&peer, "stale").await;
        }
        self.attempts
            .retain(|_, record| record.last_attempt.elapsed() < STALE_SLOT_RECLAIM_AGE * 4);
    }

    fn record_attempt(&self, target: PeerId) {
        self.attempts
            .entry(target)
            .and_modify(|r| {
                r.count += 1;
                r.last_attempt = Instant::now();
            })
            .or_insert(AttemptRecord {
                count: 1,
                last_attempt: Instant::now(),
            });
    }

    async fn cooldown_for_current_state(&self) -> Duration {
        if self.connected_count().await == 0 {
            CONNECT_COOLDOWN_ISOLATED
        } else {
            CONNECT_COOLDOWN
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::memory_pair;
    use async_trait::async_trait;

    struct LoopbackFactory;

    #[async_trait]
    impl PeerTransportFactory for LoopbackFactory {
        async fn create(&self, _local_id: PeerId, _remote_id: PeerId, _role: Role) -> Box<dyn crate::transport::PeerTransport> {
            let (a, _b) = memory_pair();
            Box::new(a)
        }
    }

    fn manager() -> ConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnectionManager::new(PeerId::generate(), 2, Arc::new(LoopbackFactory), tx)
    }

    #[tokio::test]
    async fn refuses_self_connect() {
        let m = manager();
        let err = m.can_initiate(&m.local_peer_id).await.unwrap_err();
        assert_eq!(err, ConnectionError::SelfConnect);
    }

    #[tokio::test]
    async fn refuses_over_capacity() {
        let m = manager();
        m.initiate(PeerId::generate()).await.unwrap();
        m.initiate(PeerId::generate()).await.unwrap();
        let err = m.can_initiate(&PeerId::generate()).await.unwrap_err();
        assert_eq!(err, ConnectionError::CapacityReached);
    }

    #[tokio::test]
    async fn refuses_duplicate_slot() {
        let m = manager();
        let target = PeerId::generate();
        m.initiate(target).await.unwrap();
        let err = m.can_initiate(&target).await.unwrap_err();
        assert_eq!(err, ConnectionError::AlreadyConnected);
    }

    #[tokio::test]
    async fn mark_connected_emits_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let m = ConnectionManager::new(PeerId::generate(), 2, Arc::new(LoopbackFactory), tx);
        let target = PeerId::generate();
        m.initiate(target).await.unwrap();
        m.mark_connected(target).await;
        match rx.recv().await.unwrap() {
            MeshEvent::PeerConnected { peer_id } => assert_eq!(peer_id, target),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(m.connected_count().await, 1);
    }
}
