//! # Seen-Message Cache
//!
//! Bounded dedup cache for gossip message IDs, grounded on the `lru` crate
//! as used elsewhere in production gossip protocols. Capacity-bounded via
//! [`GOSSIP_SEEN_CACHE_CAPACITY`] and additionally time-bounded via
//! [`GOSSIP_SEEN_CACHE_HORIZON`]: an entry older than the horizon is
//! treated as unseen even if it has not yet been evicted by capacity.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::{GOSSIP_SEEN_CACHE_CAPACITY, GOSSIP_SEEN_CACHE_HORIZON};

/// Tracks which gossip message IDs have already been processed.
pub struct SeenCache {
    inner: Mutex<LruCache<String, Instant>>,
    horizon: Duration,
}

impl SeenCache {
    /// Build a cache bounded by both `capacity` entries and `horizon` age.
    pub fn new(capacity: usize, horizon: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            horizon,
        }
    }

    /// Mark `id` as seen if it has not been seen (within the horizon)
    /// before. Returns `true` if this is the first sighting — i.e. the
    /// message should be processed/forwarded; `false` if it is a duplicate
    /// and should be dropped.
    pub fn check_and_insert(&self, id: &str) -> bool {
        let mut cache = self.inner.lock();
        if let Some(seen_at) = cache.get(id) {
            if seen_at.elapsed() <= self.horizon {
                return false;
            }
        }
        cache.put(id.to_string(), Instant::now());
        true
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(GOSSIP_SEEN_CACHE_CAPACITY, GOSSIP_SEEN_CACHE_HORIZON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_new() {
        let cache = SeenCache::default();
        assert!(cache.check_and_insert("msg-1"));
    }

    #[test]
    fn duplicate_within_horizon_is_dropped() {
        let cache = SeenCache::default();
        assert!(cache.check_and_insert("msg-1"));
        assert!(!cache.check_and_insert("msg-1"));
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let cache = SeenCache::new(2, Duration::from_secs(60));
        cache.check_and_insert("a");
        cache.check_and_insert("b");
        cache.check_and_insert("c");
        assert_eq!(cache.len(), 2);
        assert!(cache.check_and_insert("a"));
    }

    #[test]
    fn expired_entry_treated_as_unseen() {
        let cache = SeenCache::new(10, Duration::from_millis(1));
        cache.check_and_insert("msg-1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.check_and_insert("msg-1"));
    }
}
