//! Edge-answered image queries, kept briefly so clients can look them up
//! by id after the response has been returned.

use std::time::Duration;

use super::StaleTolerantCache;
use crate::backend::ImageQuery;

/// Bounded, TTL-limited store of edge-created image queries
#[derive(Debug)]
pub struct ImageQueryCache {
    cache: StaleTolerantCache<String, ImageQuery>,
    ttl: Duration,
    max_entries: usize,
}

impl ImageQueryCache {
    /// Cache holding entries for `ttl`, at most `max_entries` at a time
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: StaleTolerantCache::new(ttl),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Remember a query under its id
    pub fn insert(&self, query: ImageQuery) {
        self.cache.remove_older_than(self.ttl);
        self.cache.insert(query.id.clone(), query);
        self.cache.evict_oldest_beyond(self.max_entries);
    }

    /// Look up a query; expired entries are dropped and reported absent
    pub fn get(&self, id: &str) -> Option<ImageQuery> {
        let key = id.to_string();
        let cached = self.cache.get(&key)?;
        if cached.age() > self.ttl {
            self.cache.remove(&key);
            return None;
        }
        Some(cached.value)
    }

    /// Number of queries held
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
