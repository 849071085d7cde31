//! Recency index shared by the stores.

use std::hash::Hash;

use chrono::{DateTime, Utc};
use lru::LruCache;

/// Tracks last access per key and yields keys least-recently-used first.
///
/// Backed by an unbounded [`LruCache`]; the stores decide what to evict, the
/// index only ranks.
pub(crate) struct AccessIndex<K: Hash + Eq> {
    order: LruCache<K, DateTime<Utc>>,
}

impl<K: Hash + Eq + Clone> AccessIndex<K> {
    pub(crate) fn new() -> Self {
        Self {
            order: LruCache::unbounded(),
        }
    }

    /// Record an access, making `key` the most recently used.
    pub(crate) fn touch(&mut self, key: K) {
        self.order.put(key, Utc::now());
    }

    pub(crate) fn remove(&mut self, key: &K) {
        self.order.pop(key);
    }

    pub(crate) fn last_access(&self, key: &K) -> Option<DateTime<Utc>> {
        self.order.peek(key).copied()
    }

    /// Keys ordered oldest access first.
    pub(crate) fn oldest_first(&self) -> Vec<K> {
        self.order.iter().rev().map(|(key, _)| key.clone()).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
    }
}
