//! Peer discovery, eviction, and connection-optimizer policy (spec.md §4.3,
//! §4.4).

pub mod eviction;
pub mod optimizer;
pub mod registry;

pub use eviction::EvictionManager;
pub use optimizer::Optimizer;
pub use registry::{DiscoveredPeer, PeerRegistry};
