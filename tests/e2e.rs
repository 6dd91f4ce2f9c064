//! End-to-end integration tests for the mesh core.
//!
//! These exercise the cross-component scenarios that motivate the design:
//! a two-peer handshake from discovery through `connected`, gossip
//! broadcast across a chain with loop suppression, namespace-isolated DHT
//! storage, XOR-distance eviction, elected keep-alive pinging, and
//! last-writer-wins conflict resolution. Each test wires only the
//! components it needs directly (no real network, no real WebRTC) using
//! the in-memory transport doubles from `peerpigeon_mesh::transport`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use peerpigeon_mesh::connection::ConnectionManager;
use peerpigeon_mesh::dht::{DhtRecord, Space, WebDht};
use peerpigeon_mesh::discovery::EvictionManager;
use peerpigeon_mesh::events::MeshEvent;
use peerpigeon_mesh::gossip::{GossipManager, GossipMessage};
use peerpigeon_mesh::metrics::MeshMetrics;
use peerpigeon_mesh::peer_id::PeerId;
use peerpigeon_mesh::signaling::SignalingClient;
use peerpigeon_mesh::transport::{
    MemoryPeerTransportFactory, MemorySignalingFactory, PeerTransportEvent,
};
use peerpigeon_mesh::{Mesh, MeshConfig};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A peer ID whose first byte is `lead` and remaining bytes are `fill`,
/// used to place peers at controlled XOR distances from an all-zero origin.
fn id_with_lead_byte(lead: u8, fill: u8) -> PeerId {
    let hex = format!("{:02x}{}", lead, format!("{:02x}", fill).repeat(19));
    PeerId::from_hex(&hex).unwrap()
}

fn zero_id() -> PeerId {
    PeerId::from_hex(&"00".repeat(20)).unwrap()
}

/// A bare connection manager + gossip manager pair sharing one in-memory
/// peer network, plus the metrics handle so tests can assert on gossip
/// counters directly rather than through `Mesh`'s aggregate dispatch.
struct Node {
    connections: Arc<ConnectionManager>,
    gossip: Arc<GossipManager>,
    metrics: MeshMetrics,
}

fn build_node(local: PeerId, max_peers: usize, factory: &Arc<MemoryPeerTransportFactory>) -> Node {
    let (tx, _rx) = mpsc::unbounded_channel();
    let metrics = MeshMetrics::new();
    let connections = Arc::new(ConnectionManager::new(local, max_peers, factory.clone(), tx.clone()));
    let gossip = Arc::new(GossipManager::new(local, connections.clone(), tx, metrics.clone()));
    Node { connections, gossip, metrics }
}

/// Drains a connection's transport events into its owner's gossip manager,
/// mirroring what `Mesh::spawn_connection_event_loop` does for the subset
/// of events these tests care about.
fn spawn_gossip_bridge(node_connections: Arc<ConnectionManager>, node_gossip: Arc<GossipManager>, peer: PeerId) {
    let conn = node_connections.get(&peer).expect("connection slot must exist before bridging");
    let mut events = conn.take_events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PeerTransportEvent::DataChannelOpen => node_connections.mark_connected(peer).await,
                PeerTransportEvent::Message(bytes) => node_gossip.handle_incoming(peer, &bytes).await,
                _ => {}
            }
        }
    });
}

/// Performs an offer/answer handshake between two independently owned
/// nodes sharing one in-memory peer network, then bridges each side's
/// transport events into its own gossip manager.
async fn connect_nodes(a: &Node, id_a: PeerId, b: &Node, id_b: PeerId) {
    let offer = a.connections.initiate(id_b).await.expect("initiate a->b");
    spawn_gossip_bridge(a.connections.clone(), a.gossip.clone(), id_b);

    let answer = b.connections.handle_offer(id_a, offer).await.expect("accept offer b<-a");
    spawn_gossip_bridge(b.connections.clone(), b.gossip.clone(), id_a);

    a.connections.handle_answer(id_b, answer).await.expect("accept answer a<-b");

    // Let both bridges drain the transport's already-queued DataChannelOpen
    // event before the caller starts exercising the connection.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn wait_for_peer_connected(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> PeerId {
    timeout(Duration::from_secs(5), async {
        loop {
            if let MeshEvent::PeerConnected { peer_id } = events.recv().await.expect("event stream closed") {
                return peer_id;
            }
        }
    })
    .await
    .expect("timed out waiting for PeerConnected")
}

// ---------------------------------------------------------------------------
// 1. Two-peer handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_peer_handshake_reaches_connected_both_sides() {
    let signaling = Arc::new(MemorySignalingFactory::new());
    let peer_transport = Arc::new(MemoryPeerTransportFactory::new());

    let peer_a_hex = format!("{}1", "0".repeat(39));
    let peer_b_hex = format!("{}e", "f".repeat(39));

    let config_a = MeshConfig {
        peer_id_override: Some(peer_a_hex),
        ..MeshConfig::new(3, 1)
    };
    let config_b = MeshConfig {
        peer_id_override: Some(peer_b_hex),
        ..MeshConfig::new(3, 1)
    };

    let mesh_a = Arc::new(Mesh::new(config_a, signaling.clone(), peer_transport.clone()));
    let mesh_b = Arc::new(Mesh::new(config_b, signaling.clone(), peer_transport.clone()));
    assert!(mesh_a.local_peer_id() < mesh_b.local_peer_id());

    let mut events_a = mesh_a.events().await;
    let mut events_b = mesh_b.events().await;

    mesh_a.connect("memory://relay").await.unwrap();
    mesh_b.connect("memory://relay").await.unwrap();

    let connected_from_a = wait_for_peer_connected(&mut events_a).await;
    let connected_from_b = wait_for_peer_connected(&mut events_b).await;

    assert_eq!(connected_from_a, mesh_b.local_peer_id());
    assert_eq!(connected_from_b, mesh_a.local_peer_id());
}

// ---------------------------------------------------------------------------
// 2. Broadcast across a three-peer chain, with loop suppression
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_floods_chain_without_looping_back() {
    let factory = Arc::new(MemoryPeerTransportFactory::new());

    let a_id = PeerId::generate();
    let b_id = PeerId::generate();
    let c_id = PeerId::generate();

    let a = build_node(a_id, 2, &factory);
    let b = build_node(b_id, 2, &factory);
    let c = build_node(c_id, 2, &factory);

    // A -- B -- C: A and C never connect directly.
    connect_nodes(&a, a_id, &b, b_id).await;
    connect_nodes(&b, b_id, &c, c_id).await;

    a.gossip.broadcast("chat", serde_json::json!("hi")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b.metrics.gossip_delivered_total.get(), 1);
    assert_eq!(c.metrics.gossip_delivered_total.get(), 1);
    assert_eq!(b.metrics.gossip_forwarded_total.get(), 1);
    // C's only neighbor, B, is already in the message's path, so C has
    // nowhere left to forward to.
    assert_eq!(c.metrics.gossip_forwarded_total.get(), 0);
    assert_eq!(c.metrics.gossip_dropped_total.get(), 1);
}

#[tokio::test]
async fn ttl_exhausted_broadcast_stops_one_hop_short() {
    let factory = Arc::new(MemoryPeerTransportFactory::new());

    let a_id = PeerId::generate();
    let b_id = PeerId::generate();
    let c_id = PeerId::generate();

    let a = build_node(a_id, 2, &factory);
    let b = build_node(b_id, 2, &factory);
    let c = build_node(c_id, 2, &factory);

    connect_nodes(&a, a_id, &b, b_id).await;
    connect_nodes(&b, b_id, &c, c_id).await;

    let mut msg = GossipMessage::new_broadcast(a_id, "chat", serde_json::json!("one-hop"));
    msg.ttl = 1;
    let payload = serde_json::to_vec(&msg).unwrap();
    b.gossip.handle_incoming(a_id, &payload).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(b.metrics.gossip_delivered_total.get(), 1);
    assert_eq!(c.metrics.gossip_delivered_total.get(), 0);
}

// ---------------------------------------------------------------------------
// 3. DHT namespace isolation across networks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dht_record_does_not_cross_network_boundary() {
    let (tx_x, _rx_x) = mpsc::unbounded_channel();
    let dht_x = WebDht::new(PeerId::generate(), "alpha", 3, MeshMetrics::new(), tx_x);

    let (tx_y, _rx_y) = mpsc::unbounded_channel();
    let dht_y = WebDht::new(PeerId::generate(), "beta", 3, MeshMetrics::new(), tx_y);

    let record = dht_x.build_record("k", serde_json::json!({"n": 1}), Space::Private);
    assert!(dht_x.apply(record.clone()));
    assert_eq!(dht_x.get_local("k").unwrap().value, serde_json::json!({"n": 1}));

    // The record is namespaced "alpha:k"; Y's network is "beta", so it is
    // rejected outright rather than silently adopted.
    assert!(!dht_y.apply(record));
    assert!(dht_y.get_local("k").is_none());
}

// ---------------------------------------------------------------------------
// 4. Eviction by XOR distance when the slot set is full
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closer_candidate_evicts_the_farthest_connected_peer() {
    let local = zero_id();
    let near = id_with_lead_byte(0x10, 0x00);
    let mid = id_with_lead_byte(0x80, 0x00);
    let far = id_with_lead_byte(0xc0, 0x00);

    let factory = Arc::new(MemoryPeerTransportFactory::new());
    let (tx, mut events) = mpsc::unbounded_channel();
    let connections = Arc::new(ConnectionManager::new(local, 2, factory, tx));

    connections.initiate(mid).await.unwrap();
    connections.initiate(far).await.unwrap();
    connections.mark_connected(mid).await;
    connections.mark_connected(far).await;
    let _ = events.recv().await;
    let _ = events.recv().await;

    // At capacity: a third peer cannot be admitted without eviction.
    assert!(connections.can_initiate(&near).await.is_err());

    let eviction = EvictionManager::new(true);
    let connected = connections.connected_with_timestamps().await;
    let victim = eviction.choose_victim(&local, &connected).expect("a victim exists");
    assert_eq!(victim, far);
    assert!(eviction.candidate_improves_on(&local, &near, &victim));

    connections.evict(&victim, "topology optimization").await;
    match events.recv().await.unwrap() {
        MeshEvent::PeerEvicted { peer_id, reason } => {
            assert_eq!(peer_id, far);
            assert_eq!(reason, "topology optimization");
        }
        other => panic!("expected PeerEvicted, got {other:?}"),
    }

    assert!(connections.can_initiate(&near).await.is_ok());
    assert!(!connections.connected_peer_ids().await.contains(&far));
}

// ---------------------------------------------------------------------------
// 5. Keep-alive election among connected peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lowest_peer_id_is_sole_pinger_and_reelection_follows_departure() {
    let p1 = id_with_lead_byte(0x01, 0x00);
    let p2 = id_with_lead_byte(0x02, 0x00);
    let p3 = id_with_lead_byte(0x03, 0x00);

    let factory = Arc::new(MemorySignalingFactory::new());
    let (tx1, _rx1) = mpsc::unbounded_channel();
    let client1 = Arc::new(SignalingClient::new(p1, "memory://relay", factory.clone(), tx1));
    client1.connect().await.unwrap();

    let (tx2, _rx2) = mpsc::unbounded_channel();
    let client2 = Arc::new(SignalingClient::new(p2, "memory://relay", factory.clone(), tx2));
    client2.connect().await.unwrap();

    // While P1 is present, only P1 is elected.
    assert!(client1.is_elected_pinger(&[p2, p3]));
    assert!(!client2.is_elected_pinger(&[p1, p3]));

    // P1 leaves the mesh; P2 becomes the new minimum among the survivors.
    assert!(client2.is_elected_pinger(&[p3]));
}

// ---------------------------------------------------------------------------
// 6. DHT conflict resolution: higher timestamp wins, ties broken by publisher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_timestamp_wins_and_stale_write_is_rejected() {
    let peer_a = id_with_lead_byte(0xaa, 0x00);
    let peer_b = id_with_lead_byte(0xbb, 0x00);

    let (tx, _rx) = mpsc::unbounded_channel();
    let dht_b = WebDht::new(peer_b, "global", 3, MeshMetrics::new(), tx);

    let now = chrono::Utc::now();
    let from_a = DhtRecord {
        key: "global:k".to_string(),
        value: serde_json::json!(1),
        space: Space::Private,
        publisher: peer_a,
        updated_at: now,
    };
    assert!(dht_b.apply(from_a));

    let stale_from_b = DhtRecord {
        key: "global:k".to_string(),
        value: serde_json::json!(2),
        space: Space::Private,
        publisher: peer_b,
        updated_at: now - chrono::Duration::seconds(1),
    };
    assert!(!dht_b.apply(stale_from_b));

    let retained = dht_b.get_local("k").unwrap();
    assert_eq!(retained.value, serde_json::json!(1));
    assert_eq!(retained.publisher, peer_a);

    let newer_from_b = DhtRecord {
        key: "global:k".to_string(),
        value: serde_json::json!(3),
        space: Space::Private,
        publisher: peer_b,
        updated_at: now + chrono::Duration::seconds(1),
    };
    assert!(dht_b.apply(newer_from_b));
    assert_eq!(dht_b.get_local("k").unwrap().value, serde_json::json!(3));
}
