//! Epidemic broadcast and directed messaging (spec.md §4.5).

pub mod manager;
pub mod message;
pub mod seen_cache;

pub use manager::{GossipError, GossipManager};
pub use message::GossipMessage;
pub use seen_cache::SeenCache;
