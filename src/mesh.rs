//! # Mesh
//!
//! The top-level handle applications construct and drive (spec.md §2, §9):
//! owns every manager, wires their event flow through [`MeshEvent`], and
//! exposes the small public surface (`connect`, `broadcast`, `send_direct`,
//! `dht_put`, `dht_get`) that is all a host ever needs to touch directly.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::config::{
    CLEANUP_INTERVAL, DHT_QUERY_TIMEOUT, DHT_SWEEP_INTERVAL, DISCOVERY_STALE_AGE, MeshConfig,
    SIGNALING_PING_INTERVAL,
};
use crate::connection::ConnectionManager;
use crate::discovery::{EvictionManager, Optimizer, PeerRegistry};
use crate::dht::{DhtRecord, DhtResponse, RequestTable, Space, WebDht};
use crate::error::MeshError;
use crate::events::MeshEvent;
use crate::gossip::GossipManager;
use crate::metrics::MeshMetrics;
use crate::peer_id::PeerId;
use crate::signaling::SignalingClient;
use crate::transport::{PeerTransportEvent, PeerTransportFactory, Role, SignalingTransportFactory};
use crate::wire::{FrameType, SignalingFrame};

const DHT_PUT_SUBTYPE: &str = "__dht_put__";
const DHT_GET_SUBTYPE: &str = "__dht_get__";
const DHT_GET_RESPONSE_SUBTYPE: &str = "__dht_get_response__";

/// The mesh networking core: one instance per local participant.
pub struct Mesh {
    local_peer_id: PeerId,
    config: MeshConfig,
    signaling_factory: Arc<dyn SignalingTransportFactory>,
    peer_transport_factory: Arc<dyn PeerTransportFactory>,
    signaling: AsyncMutex<Option<Arc<SignalingClient>>>,
    connections: Arc<ConnectionManager>,
    registry: Arc<PeerRegistry>,
    eviction: EvictionManager,
    gossip: Arc<GossipManager>,
    dht: Arc<WebDht>,
    requests: Arc<RequestTable>,
    response_waiters: Arc<DashMap<String, oneshot::Sender<Option<Value>>>>,
    metrics: MeshMetrics,
    internal_tx: mpsc::UnboundedSender<MeshEvent>,
    public_tx: mpsc::UnboundedSender<MeshEvent>,
    public_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    sweeps_started: std::sync::atomic::AtomicBool,
}

impl Mesh {
    /// Construct a mesh. Does not connect to anything until [`connect`](Self::connect)
    /// is called.
    pub fn new(
        config: MeshConfig,
        signaling_factory: Arc<dyn SignalingTransportFactory>,
        peer_transport_factory: Arc<dyn PeerTransportFactory>,
    ) -> Self {
        let local_peer_id = config
            .peer_id_override
            .as_deref()
            .and_then(|hex| PeerId::from_hex(hex).ok())
            .unwrap_or_else(PeerId::generate);

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (public_tx, public_rx) = mpsc::unbounded_channel();
        let metrics = MeshMetrics::new();

        let connections = Arc::new(ConnectionManager::new(
            local_peer_id,
            config.max_peers,
            peer_transport_factory.clone(),
            internal_tx.clone(),
        ));
        let gossip = Arc::new(GossipManager::new(
            local_peer_id,
            connections.clone(),
            internal_tx.clone(),
            metrics.clone(),
        ));
        let dht = Arc::new(WebDht::new(
            local_peer_id,
            config.network_name.clone(),
            config.replication_factor_base,
            metrics.clone(),
            internal_tx.clone(),
        ));

        let mesh = Self {
            local_peer_id,
            config: config.clone(),
            signaling_factory,
            peer_transport_factory,
            signaling: AsyncMutex::new(None),
            connections,
            registry: Arc::new(PeerRegistry::new()),
            eviction: EvictionManager::new(config.xor_routing),
            gossip,
            dht,
            requests: Arc::new(RequestTable::new()),
            response_waiters: Arc::new(DashMap::new()),
            metrics,
            internal_tx,
            public_tx,
            public_rx: AsyncMutex::new(Some(public_rx)),
            sweeps_started: std::sync::atomic::AtomicBool::new(false),
        };

        mesh.spawn_internal_dispatch(internal_rx);
        mesh
    }

    /// Start the periodic slot-set/discovery/DHT sweeps, exactly once.
    /// Requires an `Arc<Mesh>` (the sweep task outlives `new`'s
    /// caller-local `self`), so this runs from [`Self::connect`] rather
    /// than [`Self::new`] — the sweeps have nothing to do before a relay
    /// connection exists anyway, and a reconnect must not spawn a second
    /// copy of the same loop.
    fn ensure_periodic_sweeps_started(self: &Arc<Self>) {
        use std::sync::atomic::Ordering;
        if self.sweeps_started.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.spawn_periodic_sweeps();
        }
    }

    /// This node's own peer ID.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Handle to this mesh's Prometheus metrics.
    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }

    /// Take ownership of the host-facing event stream. Call once.
    pub async fn events(&self) -> mpsc::UnboundedReceiver<MeshEvent> {
        self.public_rx
            .lock()
            .await
            .take()
            .expect("events receiver already taken")
    }

    /// Connect to a signaling relay at `url` and begin processing inbound
    /// frames.
    pub async fn connect(self: &Arc<Self>, url: impl Into<String>) -> Result<(), MeshError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingFrame>();
        let url = url.into();
        let client = Arc::new(SignalingClient::new(
            self.local_peer_id,
            url.clone(),
            self.signaling_factory.clone(),
            inbound_tx,
        ));

        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        client.on_unsolicited_disconnect(disconnect_tx).await;

        client.connect().await?;
        *self.signaling.lock().await = Some(client.clone());

        let _ = self.public_tx.send(MeshEvent::Initialized {
            local_peer_id: self.local_peer_id,
        });
        let _ = self.public_tx.send(MeshEvent::Connected);

        self.spawn_signaling_dispatch(client.clone(), inbound_rx);
        self.spawn_keepalive_loop(client.clone());
        self.spawn_reconnect_supervisor(client, disconnect_rx);
        self.ensure_periodic_sweeps_started();
        Ok(())
    }

    /// Broadcast `content` under `subtype` to the whole mesh.
    pub async fn broadcast(&self, subtype: impl Into<String>, content: Value) -> Result<(), MeshError> {
        self.gossip.broadcast(subtype, content).await?;
        Ok(())
    }

    /// Send `content` under `subtype` directly toward `target`.
    pub async fn send_direct(
        &self,
        target: PeerId,
        subtype: impl Into<String>,
        content: Value,
    ) -> Result<(), MeshError> {
        self.gossip.send_direct(target, subtype, content).await?;
        Ok(())
    }

    /// Store `value` under `key` in the WebDHT, replicating it to the
    /// closest peers for the given [`Space`].
    pub async fn dht_put(&self, key: &str, value: Value, space: Space) -> Result<(), MeshError> {
        let record = self.dht.build_record(key, value, space);
        self.dht.apply(record.clone());

        let known = self.known_peer_universe().await;
        let targets = self.dht.replication_targets(key, space, &known);
        for target in targets {
            if target == self.local_peer_id {
                continue;
            }
            if let Ok(payload) = serde_json::to_value(&record) {
                if let Err(e) = self.gossip.send_direct(target, DHT_PUT_SUBTYPE, payload).await {
                    warn!(%target, error = %e, "failed to replicate dht record");
                }
            }
        }
        Ok(())
    }

    /// Fetch the value stored under `key`, checking the local store first
    /// and falling back to a network query against the closest peers.
    pub async fn dht_get(&self, key: &str) -> Result<Option<Value>, MeshError> {
        if let Some(record) = self.dht.get_local(key) {
            return Ok(Some(record.value));
        }

        let known = self.known_peer_universe().await;
        let targets = self.dht.replication_targets(key, Space::Private, &known);
        let targets: Vec<PeerId> = targets.into_iter().filter(|p| *p != self.local_peer_id).collect();
        if targets.is_empty() {
            return Ok(None);
        }

        let request_id = self.requests.issue(&self.dht.namespaced_key(key));
        let (tx, rx) = oneshot::channel();
        self.response_waiters.insert(request_id.clone(), tx);
        self.metrics.dht_requests_outstanding.set(self.requests.len() as i64);

        let query = serde_json::json!({ "request_id": request_id, "key": key });
        for target in &targets {
            let _ = self.gossip.send_direct(*target, DHT_GET_SUBTYPE, query.clone()).await;
        }

        let result = tokio::time::timeout(DHT_QUERY_TIMEOUT, rx).await;
        self.requests.settle(&request_id);
        self.response_waiters.remove(&request_id);
        self.metrics.dht_requests_outstanding.set(self.requests.len() as i64);

        match result {
            Ok(Ok(value)) => Ok(value),
            _ => Err(MeshError::Dht(crate::dht::DhtError::Timeout)),
        }
    }

    /// Gracefully disconnect from the relay and close every peer slot.
    pub async fn disconnect(&self) {
        if let Some(client) = self.signaling.lock().await.take() {
            client.disconnect().await;
        }
        for peer in self.connections.connected_peer_ids().await {
            self.connections.remove(&peer, "local shutdown").await;
        }
    }

    async fn known_peer_universe(&self) -> Vec<PeerId> {
        let mut known = self.registry.known_peers();
        for peer in self.connections.connected_peer_ids().await {
            if !known.contains(&peer) {
                known.push(peer);
            }
        }
        known
    }

    /// Initiate a connection to `target` if admission control and the
    /// lower-peer-ID initiation rule both allow it, producing an offer
    /// frame to send over signaling.
    async fn maybe_initiate(self: &Arc<Self>, target: PeerId) {
        let connected_count = self.connections.connected_count().await;
        if !Optimizer::should_initiate(&self.local_peer_id, &target, connected_count) {
            return;
        }

        if let Err(e) = self.connections.can_initiate(&target).await {
            if e == crate::connection::ConnectionError::CapacityReached && self.config.eviction_strategy {
                self.maybe_evict_for(target).await;
                if self.connections.can_initiate(&target).await.is_err() {
                    return;
                }
            } else {
                return;
            }
        }

        match self.connections.initiate(target).await {
            Ok(offer) => {
                self.spawn_connection_event_loop(target);
                if let Some(client) = self.signaling.lock().await.as_ref() {
                    let frame = SignalingFrame::new(
                        FrameType::Offer,
                        self.local_peer_id,
                        serde_json::to_value(&offer).unwrap_or(Value::Null),
                    )
                    .targeted(target);
                    let _ = client.send(frame).await;
                }
            }
            Err(e) => debug!(%target, error = %e, "skipped connection attempt"),
        }
    }

    /// Evict the worst current connection to make room for `candidate`,
    /// if eviction is enabled and the candidate is actually an improvement
    /// (spec.md §4.4).
    async fn maybe_evict_for(self: &Arc<Self>, candidate: PeerId) {
        let connected = self.connections.connected_with_timestamps().await;
        let Some(victim) = self.eviction.choose_victim(&self.local_peer_id, &connected) else {
            return;
        };
        if !self.eviction.candidate_improves_on(&self.local_peer_id, &candidate, &victim) {
            return;
        }
        self.connections.evict(&victim, "topology optimization").await;
    }

    fn spawn_connection_event_loop(self: &Arc<Self>, peer: PeerId) {
        let Some(conn) = self.connections.get(&peer) else { return };
        let mut events = conn.take_events();
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerTransportEvent::DataChannelOpen => {
                        this.connections.mark_connected(peer).await;
                        this.signaling_set_meshed(true).await;
                    }
                    PeerTransportEvent::Message(bytes) => {
                        this.gossip.handle_incoming(peer, &bytes).await;
                    }
                    PeerTransportEvent::IceCandidate(candidate) => {
                        if let Some(client) = this.signaling.lock().await.as_ref() {
                            let frame = SignalingFrame::new(
                                FrameType::IceCandidate,
                                this.local_peer_id,
                                serde_json::to_value(&candidate).unwrap_or(Value::Null),
                            )
                            .targeted(peer);
                            let _ = client.send(frame).await;
                        }
                    }
                    PeerTransportEvent::RemoteStreamAdded | PeerTransportEvent::RenegotiationNeeded => {
                        debug!(%peer, "peer transport requested renegotiation or added media");
                    }
                    PeerTransportEvent::Disconnected => {
                        this.connections.remove(&peer, "transport disconnected").await;
                        if this.connections.connected_count().await == 0 {
                            this.signaling_set_meshed(false).await;
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn signaling_set_meshed(&self, meshed: bool) {
        if let Some(client) = self.signaling.lock().await.as_ref() {
            client.set_meshed(meshed).await;
        }
    }

    fn spawn_signaling_dispatch(
        self: &Arc<Self>,
        client: Arc<SignalingClient>,
        mut inbound_rx: mpsc::UnboundedReceiver<SignalingFrame>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                if !frame.is_for(&this.local_peer_id) && frame.frame_type != FrameType::Announce {
                    continue;
                }
                this.handle_signaling_frame(&client, frame).await;
            }
        });
    }

    async fn handle_signaling_frame(self: &Arc<Self>, client: &Arc<SignalingClient>, frame: SignalingFrame) {
        match frame.frame_type {
            FrameType::Announce => {
                if frame.from_peer_id == self.local_peer_id {
                    return;
                }
                let is_new = self.registry.observe(frame.from_peer_id);
                if is_new {
                    let _ = self.public_tx.send(MeshEvent::PeerDiscovered {
                        peer_id: frame.from_peer_id,
                    });
                }
                if self.config.auto_discovery
                    && Optimizer::needs_more_connections(&self.config, self.connections.connected_count().await)
                {
                    self.maybe_initiate(frame.from_peer_id).await;
                }
            }
            FrameType::Offer => {
                let Ok(offer) = serde_json::from_value(frame.data.clone()) else { return };
                match self.connections.handle_offer(frame.from_peer_id, offer).await {
                    Ok(answer) => {
                        self.spawn_connection_event_loop(frame.from_peer_id);
                        let reply = SignalingFrame::new(
                            FrameType::Answer,
                            self.local_peer_id,
                            serde_json::to_value(&answer).unwrap_or(Value::Null),
                        )
                        .targeted(frame.from_peer_id);
                        let _ = client.send(reply).await;
                    }
                    Err(e) => debug!(from = %frame.from_peer_id, error = %e, "rejected inbound offer"),
                }
            }
            FrameType::Answer => {
                let Ok(answer) = serde_json::from_value(frame.data.clone()) else { return };
                if let Err(e) = self.connections.handle_answer(frame.from_peer_id, answer).await {
                    debug!(from = %frame.from_peer_id, error = %e, "failed to apply answer");
                }
            }
            FrameType::IceCandidate => {
                let Ok(candidate) = serde_json::from_value(frame.data.clone()) else { return };
                if let Err(e) = self.connections.handle_ice_candidate(frame.from_peer_id, candidate).await {
                    debug!(from = %frame.from_peer_id, error = %e, "failed to apply ice candidate");
                }
            }
            FrameType::Goodbye => {
                self.registry.remove(&frame.from_peer_id);
                self.connections.remove(&frame.from_peer_id, "peer said goodbye").await;
            }
            FrameType::Connected | FrameType::Pong | FrameType::Ping | FrameType::Cleanup
            | FrameType::CleanupAll | FrameType::Unknown => {
                debug!(frame_type = ?frame.frame_type, "no local handling for this frame type");
            }
        }
    }

    fn spawn_internal_dispatch(&self, mut internal_rx: mpsc::UnboundedReceiver<MeshEvent>) {
        let gossip = self.gossip.clone();
        let dht = self.dht.clone();
        let requests = self.requests.clone();
        let response_waiters = self.response_waiters.clone();
        let public_tx = self.public_tx.clone();
        let metrics = self.metrics.clone();
        let connections = self.connections.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                match event {
                    MeshEvent::MessageReceived { subtype, content, .. } if subtype == DHT_PUT_SUBTYPE => {
                        if let Ok(record) = serde_json::from_value::<DhtRecord>(content) {
                            dht.apply(record);
                        }
                    }
                    MeshEvent::MessageReceived { from, subtype, content } if subtype == DHT_GET_SUBTYPE => {
                        let request_id = content.get("request_id").and_then(Value::as_str).unwrap_or_default();
                        let key = content.get("key").and_then(Value::as_str).unwrap_or_default();
                        let value = dht.get_local(key).map(|r| r.value);
                        let response = DhtResponse {
                            request_id: request_id.to_string(),
                            value,
                        };
                        if let Ok(payload) = serde_json::to_value(&response) {
                            let _ = gossip.send_direct(from, DHT_GET_RESPONSE_SUBTYPE, payload).await;
                        }
                    }
                    MeshEvent::MessageReceived { subtype, content, .. } if subtype == DHT_GET_RESPONSE_SUBTYPE => {
                        if let Ok(response) = serde_json::from_value::<DhtResponse>(content) {
                            // A non-holding replica answers with `value: None`; per
                            // spec.md §4.6 only a found response settles the query,
                            // so a negative reply is dropped and the waiter stays
                            // registered for another replica's answer or the sweep
                            // timeout.
                            if response.value.is_some() {
                                requests.settle(&response.request_id);
                                metrics.dht_requests_outstanding.set(requests.len() as i64);
                                if let Some((_, tx)) = response_waiters.remove(&response.request_id) {
                                    let _ = tx.send(response.value);
                                }
                            }
                        }
                    }
                    MeshEvent::PeerEvicted { .. } | MeshEvent::PeerConnected { .. } | MeshEvent::PeerDisconnected { .. } => {
                        let status = MeshEvent::StatusChanged {
                            connected_peers: connections.connected_count().await,
                            discovered_peers: registry.len(),
                        };
                        let _ = public_tx.send(event);
                        let _ = public_tx.send(status);
                    }
                    other => {
                        let _ = public_tx.send(other);
                    }
                }
            }
        });
    }

    fn spawn_periodic_sweeps(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
            let mut discovery_sweep = tokio::time::interval(DISCOVERY_STALE_AGE);
            let mut dht_sweep = tokio::time::interval(DHT_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cleanup.tick() => {
                        this.connections.sweep_stale().await;
                        let requests = this.requests.sweep_timed_out(DHT_QUERY_TIMEOUT);
                        for req in requests {
                            if let Some((_, tx)) = this.response_waiters.remove(&req.request_id) {
                                let _ = tx.send(None);
                            }
                        }
                    }
                    _ = discovery_sweep.tick() => {
                        this.registry.sweep_stale();
                    }
                    _ = dht_sweep.tick() => {
                        this.dht.sweep_expired();
                    }
                }
            }
        });
    }

    fn spawn_keepalive_loop(self: &Arc<Self>, client: Arc<SignalingClient>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SIGNALING_PING_INTERVAL);
            loop {
                ticker.tick().await;
                let connected = this.connections.connected_peer_ids().await;
                if let Err(e) = client.maybe_send_keepalive(&connected).await {
                    warn!(error = %e, "keep-alive ping failed");
                }
            }
        });
    }

    /// Watch for unsolicited signaling disconnects and reconnect with
    /// [`crate::signaling::backoff::ReconnectBackoff`]'s schedule
    /// (spec.md §4.1). A deliberate [`Self::disconnect`] never lands here —
    /// the client suppresses the notification in that case.
    fn spawn_reconnect_supervisor(
        self: &Arc<Self>,
        client: Arc<SignalingClient>,
        mut disconnect_rx: mpsc::UnboundedReceiver<()>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            while disconnect_rx.recv().await.is_some() {
                let _ = this.public_tx.send(MeshEvent::Disconnected {
                    reason: "signaling relay connection lost".to_string(),
                });
                loop {
                    let delay = client.current_backoff().await;
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    match client.connect().await {
                        Ok(()) => {
                            info!(peer_id = %this.local_peer_id, "reconnected to signaling relay");
                            let _ = this.public_tx.send(MeshEvent::Connected);
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "signaling reconnect attempt failed");
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("local_peer_id", &self.local_peer_id)
            .finish()
    }
}
