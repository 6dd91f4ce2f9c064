//! # Mesh Metrics
//!
//! Operational gauges for the mesh core, registered in a dedicated
//! [`prometheus::Registry`] so they never collide with a host application's
//! own metrics. Serving `/metrics` over HTTP is the host's concern, not the
//! core's — call [`MeshMetrics::encode`] from whatever handler the host
//! wires up.

use prometheus::{IntCounter, IntGauge, Registry};

/// Holds all Prometheus metric handles for a running mesh.
///
/// Clone-friendly (the underlying prometheus handles are themselves cheap
/// to clone) so it can be shared across the manager tasks that update it.
#[derive(Clone)]
pub struct MeshMetrics {
    registry: Registry,
    /// Number of currently connected peers.
    pub connected_peers: IntGauge,
    /// Number of peers known to discovery but not connected.
    pub discovered_peers: IntGauge,
    /// Total gossip messages forwarded to at least one neighbor.
    pub gossip_forwarded_total: IntCounter,
    /// Total gossip messages dropped (dedup, TTL, or path).
    pub gossip_dropped_total: IntCounter,
    /// Total gossip messages delivered to the local application.
    pub gossip_delivered_total: IntCounter,
    /// Current number of records held in the local DHT store.
    pub dht_records: IntGauge,
    /// Current number of DHT requests awaiting a response.
    pub dht_requests_outstanding: IntGauge,
    /// Total peers evicted from the slot set.
    pub peers_evicted_total: IntCounter,
}

impl MeshMetrics {
    /// Create and register all metrics under the `peerpigeon` namespace.
    /// Call once per [`crate::Mesh`] instance.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("peerpigeon".into()), None)
            .expect("failed to create prometheus registry");

        macro_rules! gauge {
            ($name:literal, $help:literal) => {{
                let g = IntGauge::new($name, $help).expect("metric creation");
                registry.register(Box::new(g.clone())).expect("metric registration");
                g
            }};
        }
        macro_rules! counter {
            ($name:literal, $help:literal) => {{
                let c = IntCounter::new($name, $help).expect("metric creation");
                registry.register(Box::new(c.clone())).expect("metric registration");
                c
            }};
        }

        Self {
            connected_peers: gauge!("connected_peers", "Number of currently connected peers"),
            discovered_peers: gauge!(
                "discovered_peers",
                "Number of peers known to discovery but not connected"
            ),
            gossip_forwarded_total: counter!(
                "gossip_forwarded_total",
                "Total gossip messages forwarded to at least one neighbor"
            ),
            gossip_dropped_total: counter!(
                "gossip_dropped_total",
                "Total gossip messages dropped by dedup, TTL, or path rules"
            ),
            gossip_delivered_total: counter!(
                "gossip_delivered_total",
                "Total gossip messages delivered to the local application"
            ),
            dht_records: gauge!("dht_records", "Current number of records in the local DHT store"),
            dht_requests_outstanding: gauge!(
                "dht_requests_outstanding",
                "Current number of DHT requests awaiting a response"
            ),
            peers_evicted_total: counter!("peers_evicted_total", "Total peers evicted from the slot set"),
            registry,
        }
    }

    /// Encode all registered metrics into the Prometheus text exposition
    /// format, for the host to serve however it likes.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        use prometheus::{Encoder, TextEncoder};
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}
