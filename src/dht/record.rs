//! # DHT Records & Namespaces

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer_id::PeerId;

/// Visibility/durability class of a DHT record (spec.md §4.6), controlling
/// its replication factor relative to `replication_factor_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    /// Replicated at the base factor; the common case.
    Private,
    /// Replicated to `clamp(ceil(0.3 * peer_count), 3, 7)` holders for wider
    /// availability than the default space.
    Public,
    /// Replicated to `clamp(ceil(0.5 * peer_count), 5, 10)` holders; used
    /// for data that should survive a holder dropping out without spreading
    /// as widely as `Public` (e.g. ephemeral session state).
    Frozen,
}

impl Space {
    /// The effective replication factor for this space (spec.md §4.6),
    /// given the number of connected peers available to replicate to and
    /// the network's configured base factor (used only for `Private`,
    /// which has no space-specific formula of its own):
    ///
    /// - `private`: `min(base, peer_count)`
    /// - `public`: `clamp(ceil(0.3 * peer_count), 3, 7)`
    /// - `frozen`: `clamp(ceil(0.5 * peer_count), 5, 10)`
    ///
    /// The `public`/`frozen` floors are clamped again against `peer_count`
    /// so a small mesh never targets more replicas than it has peers.
    pub fn replication_factor(self, base: usize, peer_count: usize) -> usize {
        match self {
            Space::Private => base.min(peer_count),
            Space::Public => {
                let raw = ((peer_count as f64) * 0.3).ceil() as usize;
                raw.clamp(3, 7).min(peer_count)
            }
            Space::Frozen => {
                let raw = ((peer_count as f64) * 0.5).ceil() as usize;
                raw.clamp(5, 10).min(peer_count)
            }
        }
    }
}

/// A single key/value record stored in the WebDHT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtRecord {
    /// The fully namespaced key (`"<network_name>:<key>"`).
    pub key: String,
    /// The stored value.
    pub value: Value,
    /// Replication class.
    pub space: Space,
    /// The peer that authored this version of the record.
    pub publisher: PeerId,
    /// When this version was written.
    pub updated_at: DateTime<Utc>,
}

impl DhtRecord {
    /// `true` if `self` should replace `existing` under last-writer-wins
    /// conflict resolution: strictly newer timestamp wins outright; on an
    /// exact tie, the higher publisher ID wins, giving a total order with
    /// no further input needed (spec.md §4.6).
    pub fn supersedes(&self, existing: &DhtRecord) -> bool {
        match self.updated_at.cmp(&existing.updated_at) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.publisher > existing.publisher,
        }
    }
}
