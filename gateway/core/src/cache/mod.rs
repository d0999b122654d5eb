//! Stale-Tolerant Caches
//!
//! In-memory caches that prefer serving a stale-but-valid value over
//! failing a request. Each key moves through:
//!
//! ```text
//! FRESH --(age > threshold)--> STALE --suspend--> REFRESHING
//!                                                   |
//!                          fetch ok  <--------------+--------------> fetch failed
//!                          FRESH' (new timestamp)        RESTORED (old value, old timestamp)
//! ```
//!
//! While a key is suspended it is invisible to [`StaleTolerantCache::get`];
//! a concurrent reader treats it as a miss and fetches on its own. That
//! duplicate work is accepted.
//!
//! Caches are process-local and owned by whoever constructs them; there is
//! no global cache state.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

mod detector;
mod image_query;

pub use detector::{CacheError, DetectorMetadataCache};
pub use image_query::ImageQueryCache;

// ============================================================================
// Entries
// ============================================================================

/// A cached value and when it was stored or last refreshed
#[derive(Clone, Debug, PartialEq)]
pub struct CachedValue<V> {
    /// The value
    pub value: V,
    /// Insertion or refresh time
    pub refreshed_at: Instant,
}

impl<V> CachedValue<V> {
    /// Wrap a value stamped now
    pub fn new(value: V) -> Self {
        Self {
            value,
            refreshed_at: Instant::now(),
        }
    }

    /// Time since the value was stored
    #[must_use]
    pub fn age(&self) -> Duration {
        self.refreshed_at.elapsed()
    }
}

/// Per-key state; a key missing from the map is absent
#[derive(Clone, Debug, PartialEq)]
pub enum EntryState<V> {
    /// Visible to readers
    Fresh(CachedValue<V>),
    /// Hidden while a refresh is in flight; kept for restore
    Suspended(CachedValue<V>),
}

/// Result of [`StaleTolerantCache::refresh_if_stale`]
#[derive(Debug)]
pub enum RefreshOutcome<E> {
    /// Nothing to do: absent, fresh, or already being refreshed
    NotStale,
    /// A new value replaced the stale one
    Refreshed,
    /// The fetch failed and the previous value was put back
    Restored(E),
}

// ============================================================================
// Cache
// ============================================================================

/// Key-value cache with suspend/restore refresh semantics
#[derive(Debug)]
pub struct StaleTolerantCache<K, V> {
    entries: RwLock<HashMap<K, EntryState<V>>>,
    staleness: Duration,
}

impl<K, V> StaleTolerantCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Cache whose entries go stale after `staleness`
    #[must_use]
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            staleness,
        }
    }

    /// Staleness threshold
    #[must_use]
    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Visible value for a key (suspended entries are a miss)
    pub fn get(&self, key: &K) -> Option<CachedValue<V>> {
        match self.entries.read().get(key) {
            Some(EntryState::Fresh(cached)) => Some(cached.clone()),
            Some(EntryState::Suspended(_)) | None => None,
        }
    }

    /// Full state of a key, including suspended shadows
    pub fn state(&self, key: &K) -> Option<EntryState<V>> {
        self.entries.read().get(key).cloned()
    }

    /// Store a value stamped now
    pub fn insert(&self, key: K, value: V) -> CachedValue<V> {
        let cached = CachedValue::new(value);
        self.entries
            .write()
            .insert(key, EntryState::Fresh(cached.clone()));
        cached
    }

    /// Drop a key entirely
    pub fn remove(&self, key: &K) -> Option<EntryState<V>> {
        self.entries.write().remove(key)
    }

    /// Whether a key holds a visible value older than the threshold
    pub fn is_stale(&self, key: &K) -> bool {
        matches!(
            self.entries.read().get(key),
            Some(EntryState::Fresh(cached)) if cached.age() > self.staleness
        )
    }

    /// Hide a fresh value, returning a copy of it as the shadow
    ///
    /// Returns `None` if the key is absent or already suspended.
    pub fn suspend(&self, key: &K) -> Option<CachedValue<V>> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        match entry {
            EntryState::Fresh(cached) => {
                let shadow = cached.clone();
                *entry = EntryState::Suspended(shadow.clone());
                Some(shadow)
            }
            EntryState::Suspended(_) => None,
        }
    }

    /// Put a shadow back verbatim, timestamp included
    ///
    /// A fresh value stored meanwhile (by a concurrent fetch) wins and is
    /// left alone; returns whether the shadow was restored.
    pub fn restore(&self, key: K, shadow: CachedValue<V>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(EntryState::Fresh(_)) => false,
            Some(EntryState::Suspended(_)) | None => {
                entries.insert(key, EntryState::Fresh(shadow));
                true
            }
        }
    }

    /// Refresh a stale key, restoring the old value if the fetch fails
    ///
    /// Dropping the returned future mid-fetch also restores the old value.
    pub async fn refresh_if_stale<F, Fut, E>(&self, key: &K, fetch: F) -> RefreshOutcome<E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !self.is_stale(key) {
            return RefreshOutcome::NotStale;
        }
        let Some(shadow) = self.suspend(key) else {
            return RefreshOutcome::NotStale;
        };
        let mut guard = ShadowGuard {
            cache: self,
            key: key.clone(),
            shadow: Some(shadow),
        };

        match fetch().await {
            Ok(value) => {
                guard.disarm();
                self.insert(key.clone(), value);
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                guard.restore_now();
                RefreshOutcome::Restored(e)
            }
        }
    }

    /// Number of keys in any state
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop fresh entries older than `max_age`
    pub fn remove_older_than(&self, max_age: Duration) {
        self.entries.write().retain(|_, state| match state {
            EntryState::Fresh(cached) => cached.age() <= max_age,
            EntryState::Suspended(_) => true,
        });
    }

    /// Evict the oldest entries until at most `max` remain
    pub fn evict_oldest_beyond(&self, max: usize) {
        let mut entries = self.entries.write();
        if entries.len() <= max {
            return;
        }
        let mut by_age: Vec<(Instant, K)> = entries
            .iter()
            .map(|(key, state)| {
                let (EntryState::Fresh(cached) | EntryState::Suspended(cached)) = state;
                (cached.refreshed_at, key.clone())
            })
            .collect();
        by_age.sort_by_key(|(at, _)| *at);
        let excess = entries.len() - max;
        for (_, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }
    }
}

/// Puts a suspended shadow back unless disarmed
struct ShadowGuard<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a StaleTolerantCache<K, V>,
    key: K,
    shadow: Option<CachedValue<V>>,
}

impl<K, V> ShadowGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn disarm(&mut self) {
        self.shadow = None;
    }

    fn restore_now(&mut self) {
        if let Some(shadow) = self.shadow.take() {
            self.cache.restore(self.key.clone(), shadow);
        }
    }
}

impl<K, V> Drop for ShadowGuard<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.restore_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stale_cache() -> StaleTolerantCache<String, u32> {
        StaleTolerantCache::new(Duration::ZERO)
    }

    fn wait_past_threshold() {
        std::thread::sleep(Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_failed_refresh_restores_original() {
        let cache = stale_cache();
        let key = "det".to_string();
        let original = cache.insert(key.clone(), 1);
        wait_past_threshold();

        let outcome = cache
            .refresh_if_stale(&key, || async { Err::<u32, _>("offline") })
            .await;

        assert!(matches!(outcome, RefreshOutcome::Restored("offline")));
        let after = cache.get(&key).unwrap();
        assert_eq!(after.value, 1);
        assert_eq!(after.refreshed_at, original.refreshed_at);
    }

    #[tokio::test]
    async fn test_successful_refresh_replaces_value() {
        let cache = stale_cache();
        let key = "det".to_string();
        let original = cache.insert(key.clone(), 1);
        wait_past_threshold();

        let outcome = cache
            .refresh_if_stale(&key, || async { Ok::<_, ()>(2) })
            .await;

        assert!(matches!(outcome, RefreshOutcome::Refreshed));
        let after = cache.get(&key).unwrap();
        assert_eq!(after.value, 2);
        assert!(after.refreshed_at > original.refreshed_at);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_not_refreshed() {
        let cache: StaleTolerantCache<String, u32> = StaleTolerantCache::new(Duration::from_secs(60));
        cache.insert("det".to_string(), 1);

        let outcome = cache
            .refresh_if_stale(&"det".to_string(), || async { Ok::<_, ()>(2) })
            .await;

        assert!(matches!(outcome, RefreshOutcome::NotStale));
        assert_eq!(cache.get(&"det".to_string()).unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_restores_original() {
        let cache = stale_cache();
        let key = "det".to_string();
        let original = cache.insert(key.clone(), 1);
        wait_past_threshold();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            cache.refresh_if_stale(&key, std::future::pending::<Result<u32, ()>>),
        )
        .await;
        assert!(cancelled.is_err());

        assert_eq!(cache.get(&key).unwrap(), original);
        assert!(matches!(cache.state(&key), Some(EntryState::Fresh(_))));

        let outcome = cache
            .refresh_if_stale(&key, || async { Err::<u32, _>("offline") })
            .await;
        assert!(matches!(outcome, RefreshOutcome::Restored("offline")));
        assert_eq!(cache.get(&key).unwrap().value, 1);
    }

    #[test]
    fn test_suspended_entry_is_a_miss() {
        let cache = stale_cache();
        let key = "det".to_string();
        cache.insert(key.clone(), 1);

        let shadow = cache.suspend(&key).unwrap();
        assert!(cache.get(&key).is_none());
        assert!(matches!(cache.state(&key), Some(EntryState::Suspended(_))));
        assert!(cache.suspend(&key).is_none());

        assert!(cache.restore(key.clone(), shadow));
        assert_eq!(cache.get(&key).unwrap().value, 1);
    }

    #[test]
    fn test_restore_after_shadow_deleted() {
        let cache = stale_cache();
        let key = "det".to_string();
        let original = cache.insert(key.clone(), 7);

        let shadow = cache.suspend(&key).unwrap();
        cache.remove(&key);

        assert!(cache.restore(key.clone(), shadow));
        assert_eq!(cache.get(&key).unwrap(), original);
    }

    #[test]
    fn test_restore_keeps_concurrent_fresh_value() {
        let cache = stale_cache();
        let key = "det".to_string();
        cache.insert(key.clone(), 1);

        let shadow = cache.suspend(&key).unwrap();
        cache.insert(key.clone(), 2);

        assert!(!cache.restore(key.clone(), shadow));
        assert_eq!(cache.get(&key).unwrap().value, 2);
    }

    #[test]
    fn test_evict_oldest_beyond() {
        let cache: StaleTolerantCache<u32, u32> = StaleTolerantCache::new(Duration::from_secs(60));
        for n in 0..4 {
            cache.insert(n, n);
            std::thread::sleep(Duration::from_millis(2));
        }

        cache.evict_oldest_beyond(2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&0).is_none());
        assert!(cache.get(&3).is_some());
    }
}
