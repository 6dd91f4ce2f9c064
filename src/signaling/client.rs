//! # Signaling Client
//!
//! Owns the relay connection: connect/reconnect with [`ReconnectBackoff`],
//! frame send/receive, and the keep-alive ping election from spec.md §4.1
//! ("the mesh elects a single pinger so the relay sees steady traffic
//! without every peer redundantly pinging it").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::{SIGNALING_PING_INTERVAL, SIGNALING_SEND_TIMEOUT};
use crate::peer_id::PeerId;
use crate::signaling::backoff::ReconnectBackoff;
use crate::transport::{SignalingTransport, SignalingTransportFactory, TransportError};
use crate::wire::{FrameType, SignalingFrame};

/// Errors the signaling client surfaces to its caller. Most transient
/// failures (lost connection, pending reconnect) are instead reported as
/// [`crate::events::MeshEvent::Disconnected`]; this type is for the handful
/// of calls that return a `Result` directly (spec.md §7).
#[derive(Debug, Error)]
pub enum SignalingError {
    /// `send` was called while not connected to the relay.
    #[error("not connected to signaling relay")]
    NotConnected,
    /// A send did not complete within [`SIGNALING_SEND_TIMEOUT`].
    #[error("signaling send timed out")]
    SendTimeout,
    /// The relay connection could not be established.
    #[error("failed to connect to signaling relay: {0}")]
    ConnectFailed(String),
}

impl From<TransportError> for SignalingError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => Self::NotConnected,
            TransportError::Timeout => Self::SendTimeout,
            TransportError::Closed(m) | TransportError::Io(m) => Self::ConnectFailed(m),
        }
    }
}

/// The relay connection for one mesh participant.
///
/// `connect` and `send` take `&self`; the live transport sits behind an
/// async mutex so a reconnect can swap it out while other callers wait
/// rather than observing a torn state.
pub struct SignalingClient {
    local_peer_id: PeerId,
    url: String,
    factory: Arc<dyn SignalingTransportFactory>,
    transport: AsyncMutex<Option<Arc<dyn SignalingTransport>>>,
    backoff: AsyncMutex<ReconnectBackoff>,
    inbound_tx: mpsc::UnboundedSender<SignalingFrame>,
    /// Set by [`Self::disconnect`] so the recv loop can tell a deliberate
    /// close from an unexpected one and skip the unsolicited-disconnect
    /// notification in the latter case only.
    shutting_down: AtomicBool,
    /// Fires once when the transport drops unexpectedly, so an owner (the
    /// mesh's reconnect supervisor) can react with backoff (spec.md §4.1).
    /// `None` until [`Self::on_unsolicited_disconnect`] is called.
    unsolicited_disconnect_tx: AsyncMutex<Option<mpsc::UnboundedSender<()>>>,
}

impl SignalingClient {
    /// Build a new, not-yet-connected client. Inbound frames (once
    /// connected) are pushed to `inbound_tx` for the connection manager to
    /// drain.
    pub fn new(
        local_peer_id: PeerId,
        url: impl Into<String>,
        factory: Arc<dyn SignalingTransportFactory>,
        inbound_tx: mpsc::UnboundedSender<SignalingFrame>,
    ) -> Self {
        Self {
            local_peer_id,
            url: url.into(),
            factory,
            transport: AsyncMutex::new(None),
            backoff: AsyncMutex::new(ReconnectBackoff::new()),
            inbound_tx,
            shutting_down: AtomicBool::new(false),
            unsolicited_disconnect_tx: AsyncMutex::new(None),
        }
    }

    /// Register a channel to be notified (once) the next time the relay
    /// connection drops without [`Self::disconnect`] having been called.
    /// The mesh's reconnect supervisor registers this right after
    /// construction, before the first [`Self::connect`].
    pub async fn on_unsolicited_disconnect(&self, tx: mpsc::UnboundedSender<()>) {
        *self.unsolicited_disconnect_tx.lock().await = Some(tx);
    }

    /// This client's own peer ID.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Connect to the relay, announce, and spawn the background receive
    /// loop. On failure, records a backoff failure and returns the error;
    /// the caller (the mesh's reconnect task) decides whether to retry.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SignalingError> {
        self.shutting_down.store(false, Ordering::SeqCst);
        let built = self.factory.connect(&self.url).await;
        let mut transport = match built {
            Ok(t) => t,
            Err(e) => {
                self.backoff.lock().await.record_failure();
                return Err(e.into());
            }
        };

        let announce = SignalingFrame::new(
            FrameType::Announce,
            self.local_peer_id,
            serde_json::Value::Null,
        );
        if let Err(e) = transport.send(announce).await {
            self.backoff.lock().await.record_failure();
            return Err(e.into());
        }

        self.backoff.lock().await.record_success();
        *self.transport.lock().await = Some(Arc::from(transport));
        info!(peer_id = %self.local_peer_id, "connected to signaling relay");

        self.spawn_recv_loop();
        Ok(())
    }

    /// Tell the backoff tracker whether this peer currently has a live mesh
    /// connection, widening the reconnect ceiling once meshed.
    pub async fn set_meshed(&self, meshed: bool) {
        self.backoff.lock().await.set_meshed(meshed);
    }

    /// How long the reconnect loop should wait before the next attempt,
    /// given failures recorded so far.
    pub async fn current_backoff(&self) -> std::time::Duration {
        self.backoff.lock().await.current_delay()
    }

    /// Send a frame over the relay, timing out after
    /// [`SIGNALING_SEND_TIMEOUT`].
    pub async fn send(&self, frame: SignalingFrame) -> Result<(), SignalingError> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(SignalingError::NotConnected)?;
        tokio::time::timeout(SIGNALING_SEND_TIMEOUT, transport.send(frame))
            .await
            .map_err(|_| SignalingError::SendTimeout)??;
        Ok(())
    }

    /// Send a keep-alive ping, but only if this peer is the elected pinger
    /// (spec.md §4.1): the lowest peer ID among itself and its currently
    /// connected peers. Returns whether a ping was actually sent.
    pub async fn maybe_send_keepalive(
        &self,
        connected_peers: &[PeerId],
    ) -> Result<bool, SignalingError> {
        if !self.is_elected_pinger(connected_peers) {
            return Ok(false);
        }
        let ping = SignalingFrame::new(FrameType::Ping, self.local_peer_id, serde_json::Value::Null);
        self.send(ping).await?;
        debug!(peer_id = %self.local_peer_id, "sent elected keep-alive ping");
        Ok(true)
    }

    /// `true` if `self` holds the lowest peer ID among itself and
    /// `connected_peers` — the sole elected pinger for this mesh.
    pub fn is_elected_pinger(&self, connected_peers: &[PeerId]) -> bool {
        connected_peers.iter().all(|p| self.local_peer_id < *p)
    }

    /// Gracefully leave: send `goodbye`, then close the transport.
    pub async fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            let goodbye =
                SignalingFrame::new(FrameType::Goodbye, self.local_peer_id, serde_json::Value::Null);
            let _ = transport.send(goodbye).await;
            transport.close().await;
        }
    }

    /// Runs until the transport closes or is torn down by [`Self::disconnect`].
    ///
    /// Only ever clones the `Arc` out of `self.transport` while the lock is
    /// held, then drops the guard before the suspending `recv().await` — so
    /// this loop never blocks [`Self::send`] or [`Self::disconnect`] while
    /// waiting for the relay to have something to say (spec.md §5, "no lock
    /// is held across a suspension").
    fn spawn_recv_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let transport = match this.transport.lock().await.clone() {
                    Some(transport) => transport,
                    None => return,
                };
                match transport.recv().await {
                    Some(frame) => {
                        if this.inbound_tx.send(frame).is_err() {
                            return;
                        }
                    }
                    None => {
                        warn!(peer_id = %this.local_peer_id, "signaling relay closed the connection");
                        *this.transport.lock().await = None;
                        if !this.shutting_down.load(Ordering::SeqCst) {
                            if let Some(tx) = this.unsolicited_disconnect_tx.lock().await.as_ref() {
                                let _ = tx.send(());
                            }
                        }
                        return;
                    }
                }
            }
        });
    }
}

/// Default keep-alive ping cadence, re-exported for the mesh's scheduler.
pub const PING_INTERVAL: std::time::Duration = SIGNALING_PING_INTERVAL;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemorySignalingFactory;

    fn peer_from_byte(b: u8) -> PeerId {
        let hex = format!("{:02x}", b).repeat(20);
        PeerId::from_hex(&hex).unwrap()
    }

    #[tokio::test]
    async fn connect_announces_and_marks_connected() {
        let factory = Arc::new(MemorySignalingFactory::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Arc::new(SignalingClient::new(
            PeerId::generate(),
            "memory://relay",
            factory,
            tx,
        ));
        client.connect().await.unwrap();
        assert_eq!(client.current_backoff().await, std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn lowest_peer_id_is_elected_pinger() {
        let factory = Arc::new(MemorySignalingFactory::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let low = peer_from_byte(0x01);
        let high = peer_from_byte(0xff);

        let client = Arc::new(SignalingClient::new(low, "memory://relay", factory, tx));
        client.connect().await.unwrap();
        assert!(client.is_elected_pinger(&[high]));

        let factory2 = Arc::new(MemorySignalingFactory::new());
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let client2 = Arc::new(SignalingClient::new(high, "memory://relay", factory2, tx2));
        client2.connect().await.unwrap();
        assert!(!client2.is_elected_pinger(&[low]));
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let factory = Arc::new(MemorySignalingFactory::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = SignalingClient::new(PeerId::generate(), "memory://relay", factory, tx);
        let frame =
            SignalingFrame::new(FrameType::Ping, client.local_peer_id(), serde_json::Value::Null);
        let err = client.send(frame).await.unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }
}
