//! Direct peer connections and the bounded slot set (spec.md §4.2, §4.3).

pub mod manager;
pub mod peer_connection;

pub use manager::{ConnectionError, ConnectionManager};
pub use peer_connection::{ConnectionState, PeerConnection};
