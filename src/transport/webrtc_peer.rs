//! # WebRTC Peer Transport
//!
//! The production [`PeerTransport`]/[`PeerTransportFactory`] pair, backed by
//! the `webrtc` crate: one `RTCPeerConnection` per remote peer, a single
//! ordered/reliable data channel (created by the initiator before the offer,
//! received by the responder via `on_data_channel`, per spec.md §4.2), and a
//! placeholder video track used only to exercise `set_local_stream`'s
//! renegotiation path (spec.md §4.2's "local media tracks are added/removed
//! on an already-connected session").
//!
//! Construction cannot fail through [`PeerTransportFactory::create`]'s
//! signature, so a setup error (codec registration, peer connection
//! creation) is reported as an immediate [`PeerTransportEvent::Disconnected`]
//! via [`FailedPeerTransport`] rather than a panic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::peer_id::PeerId;

use super::{IceCandidate, PeerTransport, PeerTransportEvent, PeerTransportFactory, Role, SdpType, SessionDescription, TransportError};

const DATA_CHANNEL_LABEL: &str = "peerpigeon";

fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_owned()],
        ..Default::default()
    }]
}

/// Builds real `webrtc`-crate-backed [`PeerTransport`]s.
#[derive(Clone)]
pub struct WebRtcPeerTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerTransportFactory {
    /// A factory using a public STUN server only (no TURN).
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// A factory using caller-supplied ICE server URLs (STUN and/or TURN).
    pub fn with_ice_servers(urls: Vec<String>) -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls,
                ..Default::default()
            }],
        }
    }

    async fn build_api() -> Result<API, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

impl Default for WebRtcPeerTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcPeerTransportFactory {
    async fn create(&self, local_id: PeerId, remote_id: PeerId, role: Role) -> Box<dyn PeerTransport> {
        match WebRtcPeerTransport::new(local_id, remote_id, role, &self.ice_servers).await {
            Ok(transport) => Box::new(transport),
            Err(e) => {
                debug!(%local_id, %remote_id, error = %e, "failed to build webrtc peer transport");
                Box::new(FailedPeerTransport::new(e))
            }
        }
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, events_tx: mpsc::UnboundedSender<PeerTransportEvent>) {
    let opened_tx = events_tx.clone();
    dc.on_open(Box::new(move || {
        let opened_tx = opened_tx.clone();
        Box::pin(async move {
            let _ = opened_tx.send(PeerTransportEvent::DataChannelOpen);
        })
    }));

    let message_tx = events_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let message_tx = message_tx.clone();
        Box::pin(async move {
            let _ = message_tx.send(PeerTransportEvent::Message(msg.data.to_vec()));
        })
    }));

    dc.on_close(Box::new(move || {
        let close_tx = events_tx.clone();
        Box::pin(async move {
            let _ = close_tx.send(PeerTransportEvent::Disconnected);
        })
    }));
}

/// A single peer's `RTCPeerConnection` plus its (possibly not-yet-open)
/// data channel.
struct WebRtcPeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
    media_track: AsyncMutex<Option<Arc<TrackLocalStaticSample>>>,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<PeerTransportEvent>>>,
}

impl WebRtcPeerTransport {
    async fn new(
        local_id: PeerId,
        remote_id: PeerId,
        role: Role,
        ice_servers: &[RTCIceServer],
    ) -> Result<Self, TransportError> {
        let api = WebRtcPeerTransportFactory::build_api().await?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let events_tx = events_tx.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    if let Ok(init) = candidate.to_json() {
                        let _ = events_tx.send(PeerTransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                })
            }));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Disconnected
                            | RTCPeerConnectionState::Failed
                            | RTCPeerConnectionState::Closed
                    ) {
                        let _ = events_tx.send(PeerTransportEvent::Disconnected);
                    }
                })
            }));
        }

        {
            let events_tx = events_tx.clone();
            peer_connection.on_negotiation_needed(Box::new(move || {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let _ = events_tx.send(PeerTransportEvent::RenegotiationNeeded);
                })
            }));
        }

        let data_channel = Arc::new(AsyncMutex::new(None));

        match role {
            Role::Initiator => {
                let dc = peer_connection
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(|e| TransportError::Io(e.to_string()))?;
                wire_data_channel(&dc, events_tx.clone());
                *data_channel.lock().await = Some(dc);
            }
            Role::Responder => {
                let slot = data_channel.clone();
                let events_tx = events_tx.clone();
                peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events_tx = events_tx.clone();
                    Box::pin(async move {
                        wire_data_channel(&dc, events_tx);
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }

        debug!(%local_id, %remote_id, ?role, "webrtc peer connection created");

        Ok(Self {
            peer_connection,
            data_channel,
            media_track: AsyncMutex::new(None),
            events_rx: AsyncMutex::new(Some(events_rx)),
        })
    }

    /// Block until ICE gathering finishes so the returned SDP carries every
    /// local candidate, rather than racing the caller to send a partial
    /// offer/answer. Trickled candidates gathered in the meantime still
    /// reach [`PeerTransportEvent::IceCandidate`] via the callback above.
    async fn await_ice_gathering(&self) {
        let mut rx = self.peer_connection.gathering_complete_promise().await;
        let _ = rx.recv().await;
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.await_ice_gathering().await;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Io("no local description after create_offer".to_string()))?;
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: local.sdp,
        })
    }

    async fn create_answer(&self, remote_offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        let offer = RTCSessionDescription::offer(remote_offer.sdp).map_err(|e| TransportError::Io(e.to_string()))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        self.await_ice_gathering().await;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Io("no local description after create_answer".to_string()))?;
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: local.sdp,
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), TransportError> {
        let desc = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| TransportError::Io(e.to_string()))?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn set_local_stream(&self, present: bool) -> Result<(), TransportError> {
        let mut track_slot = self.media_track.lock().await;
        if present {
            if track_slot.is_some() {
                return Ok(());
            }
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_owned(),
                    ..Default::default()
                },
                "mesh-video".to_owned(),
                "peerpigeon".to_owned(),
            ));
            self.peer_connection
                .add_transceiver_from_track(
                    track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            *track_slot = Some(track);
        } else {
            // Dropping our handle stops future samples; the peer connection
            // itself fires `on_negotiation_needed` so the caller can offer a
            // renegotiation that actually removes the transceiver.
            track_slot.take();
        }
        Ok(())
    }

    async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
        let dc = self.data_channel.lock().await.clone().ok_or(TransportError::NotConnected)?;
        dc.send(&bytes::Bytes::copy_from_slice(payload))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) {
        if let Some(dc) = self.data_channel.lock().await.take() {
            let _ = dc.close().await;
        }
        let _ = self.peer_connection.close().await;
    }

    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerTransportEvent> {
        self.events_rx
            .try_lock()
            .expect("events receiver locked elsewhere")
            .take()
            .expect("events receiver already taken")
    }
}

/// Stands in for a [`WebRtcPeerTransport`] that failed to construct (e.g.
/// codec registration or peer connection creation failed). Every operation
/// errors; `take_events` yields a single `Disconnected` so the owning
/// [`crate::connection::manager::ConnectionManager`] reclaims the slot the
/// same way it would for a transport that connected and then dropped.
struct FailedPeerTransport {
    reason: String,
    events_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<PeerTransportEvent>>>,
}

impl FailedPeerTransport {
    fn new(error: TransportError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(PeerTransportEvent::Disconnected);
        Self {
            reason: error.to_string(),
            events_rx: AsyncMutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl PeerTransport for FailedPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Err(TransportError::Io(self.reason.clone()))
    }

    async fn create_answer(&self, _remote_offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        Err(TransportError::Io(self.reason.clone()))
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<(), TransportError> {
        Err(TransportError::Io(self.reason.clone()))
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        Err(TransportError::Io(self.reason.clone()))
    }

    async fn set_local_stream(&self, _present: bool) -> Result<(), TransportError> {
        Err(TransportError::Io(self.reason.clone()))
    }

    async fn send_message(&self, _payload: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    async fn close(&self) {}

    fn take_events(&self) -> mpsc::UnboundedReceiver<PeerTransportEvent> {
        self.events_rx
            .try_lock()
            .expect("events receiver locked elsewhere")
            .take()
            .expect("events receiver already taken")
    }
}
