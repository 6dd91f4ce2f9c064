//! # Transport Abstractions
//!
//! spec.md §9 calls for treating the transport as an injected abstraction
//! rather than a module-level global: "provides a full-duplex framed
//! channel with the listed operations" and is "passed by value at
//! construction time." This module defines the two capability boundaries
//! the mesh core depends on —
//!
//! - [`SignalingTransport`]: the relay link used by the signaling client.
//! - [`PeerTransport`]: the WebRTC-style capability set from spec.md §9
//!   (`sendMessage`, `setLocalStream`, `createOffer`, `close`,
//!   `addIceCandidate`) used by a single peer connection.
//!
//! Each has exactly one production implementation and one in-memory test
//! double, matching "Polymorphism over capability sets" in spec.md §9.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer_id::PeerId;
use crate::wire::SignalingFrame;

pub mod webrtc_peer;
pub mod ws;

/// Errors a transport implementation can report back to its owner.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not currently connected.
    #[error("transport not connected")]
    NotConnected,
    /// The underlying channel closed, cleanly or otherwise.
    #[error("transport closed: {0}")]
    Closed(String),
    /// A send did not complete within the caller's deadline.
    #[error("send timed out")]
    Timeout,
    /// A transport-specific I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Signaling transport
// ---------------------------------------------------------------------------

/// A connected, full-duplex framed channel to the signaling relay.
///
/// Implementations own their own background I/O task; `send`/`recv` only
/// enqueue/dequeue and never block on network I/O directly, matching the
/// "no suspension point holds a lock" rule in spec.md §5.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Enqueue a frame for transmission. Returns an error if the channel
    /// has already closed.
    async fn send(&self, frame: SignalingFrame) -> Result<(), TransportError>;

    /// Receive the next inbound frame, or `None` once the channel is closed
    /// and drained. Takes `&self`, not `&mut self`: implementations buffer
    /// the inbound stream behind their own interior-mutable queue, so a
    /// caller can hold the transport behind a shared `Arc` and call `send`
    /// concurrently with an in-flight `recv` rather than needing exclusive
    /// access (spec.md §5, "no suspension point holds a lock").
    async fn recv(&self) -> Option<SignalingFrame>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// Builds a connected [`SignalingTransport`] for a given relay URL.
#[async_trait]
pub trait SignalingTransportFactory: Send + Sync {
    /// Connect to `url` and return the resulting transport, or an error if
    /// the connection attempt itself fails.
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingTransport>, TransportError>;
}

/// A shared in-process relay. Every [`MemorySignalingTransport`] built from
/// the same [`MemorySignalingFactory`] can see frames the others broadcast,
/// modeling a signaling relay without any real network I/O.
#[derive(Clone, Default)]
pub struct MemorySignalingFactory {
    inner: std::sync::Arc<parking_lot::Mutex<Vec<mpsc::UnboundedSender<SignalingFrame>>>>,
}

impl MemorySignalingFactory {
    /// Create a fresh, empty in-process relay.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingTransportFactory for MemorySignalingFactory {
    async fn connect(&self, _url: &str) -> Result<Box<dyn SignalingTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().push(tx);
        Ok(Box::new(MemorySignalingTransport {
            peers: self.inner.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

/// The in-memory [`SignalingTransport`] side of [`MemorySignalingFactory`].
pub struct MemorySignalingTransport {
    peers: std::sync::Arc<parking_lot::Mutex<Vec<mpsc::UnboundedSender<SignalingFrame>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingFrame>>,
}

#[async_trait]
impl SignalingTransport for MemorySignalingTransport {
    async fn send(&self, frame: SignalingFrame) -> Result<(), TransportError> {
        for peer in self.peers.lock().iter() {
            let _ = peer.send(frame.clone());
        }
        Ok(())
    }

    async fn recv(&self) -> Option<SignalingFrame> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// Peer transport (WebRTC-style capability set)
// ---------------------------------------------------------------------------

/// Which side of the handshake a peer connection is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Created the data channel and sent the offer.
    Initiator,
    /// Received the offer and answered.
    Responder,
}

/// The kind of session description being exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// An offer.
    Offer,
    /// An answer.
    Answer,
}

/// A WebRTC-style local/remote session description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// The SDP payload itself. Opaque to the mesh core.
    pub sdp: String,
}

/// A single trickled ICE candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line, as produced by the ICE agent.
    pub candidate: String,
    /// Media stream identification tag, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Events a [`PeerTransport`] surfaces back to its owner (the connection
/// manager / peer connection state machine).
#[derive(Clone)]
pub enum PeerTransportEvent {
    /// A local ICE candidate was gathered and should be trickled to the
    /// remote peer over signaling (or the mesh, during renegotiation).
    IceCandidate(IceCandidate),
    /// The data channel finished opening.
    DataChannelOpen,
    /// A message arrived on the data channel.
    Message(Vec<u8>),
    /// A remote media stream was added (media support is optional; callers
    /// that never add local tracks will never see this).
    RemoteStreamAdded,
    /// The underlying session requests renegotiation (e.g. local tracks
    /// changed after `connected`).
    RenegotiationNeeded,
    /// The underlying transport reports connection loss.
    Disconnected,
}

/// The capability set of a single peer connection (spec.md §4.2, §9):
/// `sendMessage`, `setLocalStream`, `createOffer`, `close`,
/// `addIceCandidate`, plus the description-exchange calls needed to drive
/// the handshake state machine in [`crate::connection::peer_connection`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local offer. Only valid for [`Role::Initiator`].
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create a local answer in response to a remote offer. Only valid for
    /// [`Role::Responder`].
    async fn create_answer(
        &self,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    /// Apply a remote description (answer, for the initiator; this is also
    /// how a responder's own answer gets locally applied by the caller).
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Add a trickled remote ICE candidate. Implementations buffer
    /// candidates that arrive before the remote description is set and
    /// drain them atomically afterward (spec.md §4.2).
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Attach or detach a local media stream. Passing `false` removes it.
    /// Adding/removing tracks on an already-open session triggers
    /// [`PeerTransportEvent::RenegotiationNeeded`].
    async fn set_local_stream(&self, present: bool) -> Result<(), TransportError>;

    /// Send an application payload over the (assumed reliable, ordered)
    /// data channel.
    async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Tear down the session. Idempotent.
    async fn close(&self);

    /// Take ownership of the event receiver. Panics if called twice —
    /// there is exactly one owner of a peer connection's events.
    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerTransportEvent>;
}

/// Builds [`PeerTransport`] instances for outbound/inbound peer sessions.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a new, not-yet-connected peer transport for `role`, connecting
    /// `local_id` to `remote_id`. Implementations backed by a shared network
    /// (real or in-memory) use the pair to rendezvous the two sides.
    async fn create(&self, local_id: PeerId, remote_id: PeerId, role: Role) -> Box<dyn PeerTransport>;
}

/// An in-process peer network usable across independently constructed
/// [`crate::mesh::Mesh`] instances in integration tests: unlike
/// [`memory::memory_pair`] (which wires up exactly two transports at
/// construction time), this factory lets any number of peers call `create`
/// in any order and still rendezvous by peer ID, the way a real ICE/SDP
/// exchange eventually would.
#[derive(Clone, Default)]
pub struct MemoryPeerTransportFactory {
    inboxes: std::sync::Arc<DashMap<(crate::peer_id::PeerId, crate::peer_id::PeerId), mpsc::UnboundedSender<PeerTransportEvent>>>,
}

impl MemoryPeerTransportFactory {
    /// Create a fresh, empty in-process peer network.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerTransportFactory for MemoryPeerTransportFactory {
    async fn create(
        &self,
        local_id: crate::peer_id::PeerId,
        remote_id: crate::peer_id::PeerId,
        _role: Role,
    ) -> Box<dyn PeerTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert((local_id, remote_id), tx.clone());
        let _ = tx.send(PeerTransportEvent::DataChannelOpen);
        Box::new(MemoryPeerTransport {
            local_id,
            remote_id,
            inboxes: self.inboxes.clone(),
            rx: tokio::sync::Mutex::new(Some(rx)),
        })
    }
}

/// The [`PeerTransport`] side of [`MemoryPeerTransportFactory`]. Looks up
/// the peer's own inbox (keyed `(remote_id, local_id)` from its point of
/// view) to deliver a message.
struct MemoryPeerTransport {
    local_id: crate::peer_id::PeerId,
    remote_id: crate::peer_id::PeerId,
    inboxes: std::sync::Arc<DashMap<(crate::peer_id::PeerId, crate::peer_id::PeerId), mpsc::UnboundedSender<PeerTransportEvent>>>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<PeerTransportEvent>>>,
}

#[async_trait]
impl PeerTransport for MemoryPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: format!("memory-offer:{}", self.local_id),
        })
    }

    async fn create_answer(
        &self,
        _remote_offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: format!("memory-answer:{}", self.local_id),
        })
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<(), TransportError> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Ok(())
    }

    async fn set_local_stream(&self, present: bool) -> Result<(), TransportError> {
        if present {
            if let Some(peer) = self.inboxes.get(&(self.local_id, self.remote_id)) {
                let _ = peer.send(PeerTransportEvent::RenegotiationNeeded);
            }
        }
        Ok(())
    }

    async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
        match self.inboxes.get(&(self.remote_id, self.local_id)) {
            Some(peer) => {
                let _ = peer.send(PeerTransportEvent::Message(payload.to_vec()));
                Ok(())
            }
            None => Err(TransportError::NotConnected),
        }
    }

    async fn close(&self) {
        if let Some(peer) = self.inboxes.get(&(self.remote_id, self.local_id)) {
            let _ = peer.send(PeerTransportEvent::Disconnected);
        }
        self.inboxes.remove(&(self.local_id, self.remote_id));
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerTransportEvent> {
        self.rx
            .try_lock()
            .expect("events receiver locked elsewhere")
            .take()
            .expect("events receiver already taken")
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! An in-process, loopback [`PeerTransport`] pair used by unit and
    //! integration tests — no real ICE/STUN required, matching the test
    //! double called for in spec.md §9.

    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    struct Shared {
        events_tx: mpsc::UnboundedSender<PeerTransportEvent>,
        events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<PeerTransportEvent>>>,
        peer: AsyncMutex<Option<Arc<Shared>>>,
    }

    /// A loopback peer transport. Two instances are linked via
    /// [`memory_pair`]; sending a message on one delivers it to the other's
    /// event stream.
    pub struct LoopbackPeerTransport {
        shared: Arc<Shared>,
    }

    /// Build a connected pair of loopback transports, as if ICE had already
    /// completed and the data channel were open on both sides.
    pub fn memory_pair() -> (LoopbackPeerTransport, LoopbackPeerTransport) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Arc::new(Shared {
            events_tx: tx_a,
            events_rx: AsyncMutex::new(Some(rx_a)),
            peer: AsyncMutex::new(None),
        });
        let b = Arc::new(Shared {
            events_tx: tx_b,
            events_rx: AsyncMutex::new(Some(rx_b)),
            peer: AsyncMutex::new(None),
        });

        *a.peer.try_lock().unwrap() = Some(b.clone());
        *b.peer.try_lock().unwrap() = Some(a.clone());

        let _ = a.events_tx.send(PeerTransportEvent::DataChannelOpen);
        let _ = b.events_tx.send(PeerTransportEvent::DataChannelOpen);

        (
            LoopbackPeerTransport { shared: a },
            LoopbackPeerTransport { shared: b },
        )
    }

    #[async_trait]
    impl PeerTransport for LoopbackPeerTransport {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: "loopback-offer".to_string(),
            })
        }

        async fn create_answer(
            &self,
            _remote_offer: SessionDescription,
        ) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp: "loopback-answer".to_string(),
            })
        }

        async fn set_remote_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
            Ok(())
        }

        async fn set_local_stream(&self, present: bool) -> Result<(), TransportError> {
            if present {
                let _ = self.shared.events_tx.send(PeerTransportEvent::RenegotiationNeeded);
            }
            Ok(())
        }

        async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
            let peer = self.shared.peer.lock().await.clone();
            if let Some(peer) = peer {
                let _ = peer.events_tx.send(PeerTransportEvent::Message(payload.to_vec()));
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            }
        }

        async fn close(&self) {
            let _ = self.shared.events_tx.send(PeerTransportEvent::Disconnected);
        }

        fn take_events(&self) -> mpsc::UnboundedReceiver<PeerTransportEvent> {
            self.shared
                .events_rx
                .try_lock()
                .expect("events receiver locked elsewhere")
                .take()
                .expect("events receiver already taken")
        }
    }
}


impl std::fmt::Debug for PeerTransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            Self::DataChannelOpen => write!(f, "DataChannelOpen"),
            Self::Message(m) => write!(f, "Message({} bytes)", m.len()),
            Self::RemoteStreamAdded => write!(f, "RemoteStreamAdded"),
            Self::RenegotiationNeeded => write!(f, "RenegotiationNeeded"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}
