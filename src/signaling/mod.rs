//! Signaling relay client (spec.md §4.1).

pub mod backoff;
pub mod client;

pub use backoff::ReconnectBackoff;
pub use client::{SignalingClient, SignalingError};
