//! # Peer Connection State Machine
//!
//! Drives a single peer's handshake from offer/answer exchange through ICE
//! gathering to an open data channel (spec.md §4.2):
//!
//! ```text
//! new -> offer-sent|answer-sent -> ice-gathering -> connected -> disconnected|failed -> closed
//! ```
//!
//! Trickled ICE candidates that arrive before the remote description is set
//! are buffered and drained once it is (`add_ice_candidate`).

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use crate::peer_id::PeerId;
use crate::transport::{
    IceCandidate, PeerTransport, PeerTransportEvent, Role, SessionDescription, TransportError,
};

/// Where a single peer connection sits in its handshake lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Freshly created, no description exchanged yet.
    New,
    /// This side created and sent an offer; awaiting an answer.
    OfferSent,
    /// This side received an offer and sent an answer; awaiting connection.
    AnswerSent,
    /// Descriptions exchanged, ICE candidates still being gathered/applied.
    IceGathering,
    /// Data channel open and usable.
    Connected,
    /// Was connected, then lost the link.
    Disconnected,
    /// Handshake did not complete within its timeout, or the transport
    /// reported an unrecoverable error.
    Failed,
    /// Torn down deliberately; terminal.
    Closed,
}

impl ConnectionState {
    /// `true` for any state from which no further progress is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// One peer's handshake and data-channel session.
pub struct PeerConnection {
    peer_id: PeerId,
    role: Role,
    state: RwLock<ConnectionState>,
    transport: Box<dyn PeerTransport>,
    pending_ice: Mutex<Vec<IceCandidate>>,
    remote_description_set: Mutex<bool>,
    created_at: Instant,
    connected_at: Mutex<Option<Instant>>,
}

impl PeerConnection {
    /// Wrap a freshly built transport for `peer_id`, playing `role`.
    pub fn new(peer_id: PeerId, role: Role, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            peer_id,
            role,
            state: RwLock::new(ConnectionState::New),
            transport,
            pending_ice: Mutex::new(Vec::new()),
            remote_description_set: Mutex::new(false),
            created_at: Instant::now(),
            connected_at: Mutex::new(None),
        }
    }

    /// The remote peer this connection is with.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// This side's role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Age of this connection since construction.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// When this connection reached `connected`, if it has.
    pub fn connected_since(&self) -> Option<Instant> {
        *self.connected_at.lock()
    }

    /// As the initiator, create the local offer and advance to
    /// `offer-sent`.
    pub async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.transport.create_offer().await?;
        *self.state.write().await = ConnectionState::OfferSent;
        Ok(offer)
    }

    /// As the responder, accept a remote offer, create the local answer,
    /// and advance to `answer-sent`.
    pub async fn accept_offer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let answer = self.transport.create_answer(remote_offer).await?;
        self.mark_remote_description_set().await;
        *self.state.write().await = ConnectionState::AnswerSent;
        Ok(answer)
    }

    /// As the initiator, apply the remote answer and move into ICE
    /// gathering.
    pub async fn accept_answer(
        &self,
        remote_answer: SessionDescription,
    ) -> Result<(), TransportError> {
        self.transport.set_remote_description(remote_answer).await?;
        self.mark_remote_description_set().await;
        *self.state.write().await = ConnectionState::IceGathering;
        Ok(())
    }

    /// Buffer or immediately apply a trickled remote ICE candidate,
    /// depending on whether the remote description has landed yet.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if *self.remote_description_set.lock() {
            self.transport.add_ice_candidate(candidate).await
        } else {
            self.pending_ice.lock().push(candidate);
            Ok(())
        }
    }

    /// Mark the handshake complete once the transport reports the data
    /// channel opened.
    pub async fn mark_connected(&self) {
        *self.state.write().await = ConnectionState::Connected;
        *self.connected_at.lock() = Some(Instant::now());
        debug!(peer_id = %self.peer_id, "peer connection established");
    }

    /// Mark the connection as lost, without closing the underlying
    /// transport (the owner decides whether to retry).
    pub async fn mark_disconnected(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Mark the handshake as failed, e.g. after a timeout.
    pub async fn mark_failed(&self) {
        *self.state.write().await = ConnectionState::Failed;
    }

    /// Send an application payload over the data channel.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.transport.send_message(payload).await
    }

    /// Tear down the transport and move to the terminal `closed` state.
    pub async fn close(&self) {
        self.transport.close().await;
        *self.state.write().await = ConnectionState::Closed;
    }

    /// Take ownership of the transport's event stream. Call once, from the
    /// task that will drive this connection's event loop.
    pub fn take_events(&self) -> tokio::sync::mpsc::UnboundedReceiver<PeerTransportEvent> {
        self.transport.take_events()
    }

    async fn mark_remote_description_set(&self) {
        *self.remote_description_set.lock() = true;
        let buffered: Vec<_> = std::mem::take(&mut *self.pending_ice.lock());
        for candidate in buffered {
            let _ = self.transport.add_ice_candidate(candidate).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::memory_pair;

    #[tokio::test]
    async fn handshake_reaches_connected() {
        let (initiator_t, responder_t) = memory_pair();
        let initiator = PeerConnection::new(PeerId::generate(), Role::Initiator, Box::new(initiator_t));
        let responder = PeerConnection::new(PeerId::generate(), Role::Responder, Box::new(responder_t));

        let offer = initiator.create_offer().await.unwrap();
        assert_eq!(initiator.state().await, ConnectionState::OfferSent);

        let answer = responder.accept_offer(offer).await.unwrap();
        assert_eq!(responder.state().await, ConnectionState::AnswerSent);

        initiator.accept_answer(answer).await.unwrap();
        assert_eq!(initiator.state().await, ConnectionState::IceGathering);

        initiator.mark_connected().await;
        responder.mark_connected().await;
        assert_eq!(initiator.state().await, ConnectionState::Connected);
        assert_eq!(responder.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn ice_candidates_buffer_until_remote_description_set() {
        let (initiator_t, _responder_t) = memory_pair();
        let initiator = PeerConnection::new(PeerId::generate(), Role::Initiator, Box::new(initiator_t));

        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        initiator.add_ice_candidate(candidate).await.unwrap();
        assert_eq!(initiator.pending_ice.lock().len(), 1);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let (initiator_t, _responder_t) = memory_pair();
        let conn = PeerConnection::new(PeerId::generate(), Role::Initiator, Box::new(initiator_t));
        conn.close().await;
        assert!(conn.state().await.is_terminal());
    }
}
