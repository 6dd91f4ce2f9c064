//! # Outstanding DHT Request Tracking
//!
//! A `get` fanned out to the closest peers is tracked here until it
//! settles (spec.md §4.6): `issued -> awaiting-response -> (response |
//! timeout) -> settled`.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

/// Where a single outstanding `get` sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Query sent, no peer has answered yet.
    AwaitingResponse,
    /// A response arrived and was accepted.
    Settled,
    /// The query timed out with no usable response.
    TimedOut,
}

/// A single in-flight `get` query.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Correlation ID carried in the outbound query and expected on the
    /// response.
    pub request_id: String,
    /// The namespaced key being queried.
    pub key: String,
    /// When the query was issued.
    pub issued_at: Instant,
    /// Current lifecycle state.
    pub state: RequestState,
}

/// Tracks all of this node's outstanding DHT queries.
#[derive(Default)]
pub struct RequestTable {
    pending: DashMap<String, PendingRequest>,
}

impl RequestTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new query for `key`, returning its request ID.
    pub fn issue(&self, key: &str) -> String {
        let request_id = Uuid::new_v4().to_string();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                request_id: request_id.clone(),
                key: key.to_string(),
                issued_at: Instant::now(),
                state: RequestState::AwaitingResponse,
            },
        );
        request_id
    }

    /// Accept a response for `request_id`, removing it from the table.
    /// Returns the settled request, or `None` if no such request is
    /// tracked (e.g. it already timed out).
    pub fn settle(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id).map(|(_, mut req)| {
            req.state = RequestState::Settled;
            req
        })
    }

    /// `true` if `request_id` is still being waited on.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Remove and return every request that has been outstanding longer
    /// than `timeout`, marked [`RequestState::TimedOut`].
    pub fn sweep_timed_out(&self, timeout: Duration) -> Vec<PendingRequest> {
        let mut timed_out = Vec::new();
        self.pending.retain(|_, req| {
            let expired = req.issued_at.elapsed() > timeout;
            if expired {
                req.state = RequestState::TimedOut;
                timed_out.push(req.clone());
            }
            !expired
        });
        timed_out
    }

    /// Number of requests currently awaiting a response.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// `true` if no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A response payload carried back to the querying peer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DhtResponse {
    /// Correlates with the [`PendingRequest::request_id`] it answers.
    pub request_id: String,
    /// The value found, or `None` if the responder has nothing for this
    /// key.
    pub value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_settle_roundtrips() {
        let table = RequestTable::new();
        let id = table.issue("global:foo");
        assert!(table.is_pending(&id));
        let settled = table.settle(&id).unwrap();
        assert_eq!(settled.state, RequestState::Settled);
        assert!(!table.is_pending(&id));
    }

    #[test]
    fn settle_unknown_request_is_none() {
        let table = RequestTable::new();
        assert!(table.settle("nonexistent").is_none());
    }

    #[test]
    fn sweep_removes_expired_requests() {
        let table = RequestTable::new();
        table.issue("global:foo");
        let timed_out = table.sweep_timed_out(Duration::from_secs(0));
        assert_eq!(timed_out.len(), 1);
        assert!(table.is_empty());
    }
}
