//! # WebDHT Store
//!
//! The local replica of the distributed key/value store (spec.md §4.6):
//! holds whatever records this node is responsible for (or has cached),
//! resolves conflicting writes by last-writer-wins, and determines which
//! peers a key's replicas belong on via the hash ring.

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::DHT_RECORD_MAX_AGE;
use crate::dht::record::{DhtRecord, Space};
use crate::dht::ring;
use crate::events::MeshEvent;
use crate::metrics::MeshMetrics;
use crate::peer_id::PeerId;

/// Failures in a DHT put/get (spec.md §7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DhtError {
    /// A `get` query did not receive any response within
    /// [`crate::config::DHT_QUERY_TIMEOUT`].
    #[error("dht query timed out")]
    Timeout,
    /// A record arrived whose namespace does not match this network.
    #[error("dht record namespace mismatch")]
    NamespaceMismatch,
    /// No record exists for the requested key, locally or via query.
    #[error("dht key not found")]
    NotFound,
}

/// This node's view of the WebDHT: its local record cache plus the policy
/// for deciding replica placement and resolving conflicts.
pub struct WebDht {
    local_peer_id: PeerId,
    network_name: String,
    replication_factor_base: usize,
    records: DashMap<String, DhtRecord>,
    metrics: MeshMetrics,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
}

impl WebDht {
    /// Build an empty store scoped to `network_name`.
    pub fn new(
        local_peer_id: PeerId,
        network_name: impl Into<String>,
        replication_factor_base: usize,
        metrics: MeshMetrics,
        events_tx: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        Self {
            local_peer_id,
            network_name: network_name.into(),
            replication_factor_base,
            records: DashMap::new(),
            metrics,
            events_tx,
        }
    }

    /// Prefix `key` with this store's network namespace.
    pub fn namespaced_key(&self, key: &str) -> String {
        format!("{}:{}", self.network_name, key)
    }

    /// This node's own peer ID.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Build (but do not store) a record for a local `put`, stamped with
    /// this node as publisher and the current time.
    pub fn build_record(&self, key: &str, value: serde_json::Value, space: Space) -> DhtRecord {
        DhtRecord {
            key: self.namespaced_key(key),
            value,
            space,
            publisher: self.local_peer_id,
            updated_at: chrono::Utc::now(),
        }
    }

    /// Apply a record to the local store, whether it originated here or
    /// arrived from a replication push. Rejects records namespaced for a
    /// different network outright (spec.md §8 "namespace isolation") before
    /// resolving conflicts via last-writer-wins; returns `true` if the
    /// record was stored (new or superseding), `false` if it was rejected
    /// on namespace grounds or an existing record won.
    pub fn apply(&self, record: DhtRecord) -> bool {
        let prefix = format!("{}:", self.network_name);
        if !record.key.starts_with(&prefix) {
            warn!(key = %record.key, network = %self.network_name, error = %DhtError::NamespaceMismatch, "rejecting dht record");
            return false;
        }

        let applied = match self.records.get(&record.key) {
            Some(existing) if !record.supersedes(&existing) => false,
            _ => true,
        };

        if applied {
            let key = record.key.clone();
            let value = record.value.clone();
            self.records.insert(key.clone(), record);
            self.metrics.dht_records.set(self.records.len() as i64);
            let _ = self.events_tx.send(MeshEvent::DhtValueChanged {
                key,
                value: Some(value),
            });
        }
        applied
    }

    /// Fetch a record from the local store, if present.
    pub fn get_local(&self, key: &str) -> Option<DhtRecord> {
        self.records.get(&self.namespaced_key(key)).map(|e| e.value().clone())
    }

    /// Remove a record outright (e.g. on explicit delete or expiry).
    pub fn remove(&self, key: &str) {
        if self.records.remove(&self.namespaced_key(key)).is_some() {
            self.metrics.dht_records.set(self.records.len() as i64);
            let _ = self.events_tx.send(MeshEvent::DhtValueChanged {
                key: self.namespaced_key(key),
                value: None,
            });
        }
    }

    /// Number of records currently held locally.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Determine which of `known_peers` (plus this node itself) should hold
    /// replicas of `key`, given `space`'s replication factor.
    pub fn replication_targets(
        &self,
        key: &str,
        space: Space,
        known_peers: &[PeerId],
    ) -> Vec<PeerId> {
        let namespaced = self.namespaced_key(key);

        let mut all: Vec<PeerId> = known_peers.to_vec();
        if !all.contains(&self.local_peer_id) {
            all.push(self.local_peer_id);
        }
        let factor = space.replication_factor(self.replication_factor_base, all.len());
        ring::closest_peers(&namespaced, &all, factor)
    }

    /// `true` if this node is among the replica holders for `key` (i.e.
    /// should store it locally without being asked).
    pub fn is_responsible_for(&self, key: &str, space: Space, known_peers: &[PeerId]) -> bool {
        self.replication_targets(key, space, known_peers)
            .contains(&self.local_peer_id)
    }

    /// Drop records older than [`DHT_RECORD_MAX_AGE`], returning their
    /// namespaced keys.
    pub fn sweep_expired(&self) -> Vec<String> {
        let mut expired = Vec::new();
        self.records.retain(|key, record| {
            let age = chrono::Utc::now().signed_duration_since(record.updated_at);
            let too_old = age
                .to_std()
                .map(|d| d > DHT_RECORD_MAX_AGE)
                .unwrap_or(false);
            if too_old {
                expired.push(key.clone());
            }
            !too_old
        });
        self.metrics.dht_records.set(self.records.len() as i64);
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> WebDht {
        let (tx, _rx) = mpsc::unbounded_channel();
        WebDht::new(PeerId::generate(), "global", 3, MeshMetrics::new(), tx)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dht = store();
        let record = dht.build_record("foo", serde_json::json!("bar"), Space::Private);
        assert!(dht.apply(record));
        let fetched = dht.get_local("foo").unwrap();
        assert_eq!(fetched.value, serde_json::json!("bar"));
    }

    #[tokio::test]
    async fn older_write_does_not_override_newer() {
        let dht = store();
        let mut first = dht.build_record("foo", serde_json::json!(1), Space::Private);
        first.updated_at = chrono::Utc::now();
        assert!(dht.apply(first.clone()));

        let mut stale = first.clone();
        stale.value = serde_json::json!(2);
        stale.updated_at = first.updated_at - chrono::Duration::seconds(10);
        assert!(!dht.apply(stale));

        assert_eq!(dht.get_local("foo").unwrap().value, serde_json::json!(1));
    }

    #[tokio::test]
    async fn replication_targets_respect_space_factor() {
        let dht = store();
        let peers: Vec<PeerId> = (0u8..10)
            .map(|b| PeerId::from_hex(&format!("{:02x}", b).repeat(20)).unwrap())
            .collect();
        let targets = dht.replication_targets("foo", Space::Public, &peers);
        assert_eq!(targets.len(), Space::Public.replication_factor(3, peers.len() + 1));
    }

    #[tokio::test]
    async fn remove_clears_local_record() {
        let dht = store();
        let record = dht.build_record("foo", serde_json::json!("bar"), Space::Private);
        dht.apply(record);
        dht.remove("foo");
        assert!(dht.get_local("foo").is_none());
    }
}
