//! # Error Types
//!
//! Per-module `thiserror` enums for each subsystem, aggregated here into a
//! single [`MeshError`] for the handful of entry points that return a
//! `Result` (spec.md §7: most failures are surfaced as events, not call
//! failures — only application entry points propagate an error).

use thiserror::Error;

pub use crate::connection::manager::ConnectionError;
pub use crate::dht::store::DhtError;
pub use crate::gossip::manager::GossipError;
pub use crate::signaling::client::SignalingError;

/// Aggregate error type returned from [`crate::Mesh`] entry points.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Failure connecting or sending over the signaling relay.
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Failure admitting or routing through the connection manager.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Failure broadcasting or directing a gossip message.
    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),

    /// Failure in a DHT put/get operation.
    #[error("dht error: {0}")]
    Dht(#[from] DhtError),

    /// The caller supplied something the core rejects outright (invalid
    /// peer ID, invalid payload type) — an application error per spec.md §7.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
