//! Bounded LRU set of recently seen nonces.
//!
//! This cache is a performance filter in front of the store: the UNIQUE
//! constraint on the events table remains the authoritative replay defence,
//! so an eviction here never admits a duplicate, it only costs one extra
//! database round-trip.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Thread-safe LRU nonce set.
#[derive(Clone)]
pub struct NonceCache {
    inner: Arc<Mutex<LruCache<String, ()>>>,
}

impl NonceCache {
    /// Creates a cache holding at most `capacity` nonces (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Records a nonce, evicting the least recently used entry when full.
    /// Re-adding an existing nonce promotes it to most recently used.
    pub fn add(&self, nonce: &str) {
        self.inner.lock().put(nonce.to_string(), ());
    }

    /// Fast-path membership check; does not change recency.
    pub fn contains(&self, nonce: &str) -> bool {
        self.inner.lock().contains(nonce)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
