use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokenward_clock::{Clock, DurationSecs, System, UnixTime};

use super::{CacheKey, CacheKeyRef, CacheStore};
use crate::error::BoxError;

/// How often writes sweep out entries that nobody read back
const PURGE_INTERVAL: DurationSecs = DurationSecs(60);

#[derive(Clone, Debug)]
struct Entry<V> {
    value: V,
    expires_at: UnixTime,
}

/// An in-process cache which evicts entries once they expire
///
/// Expired entries are dropped when read, and writes periodically sweep
/// the whole cache so keys that are never read again do not accumulate.
/// Clones share the same entries.
pub struct InMemoryCache<V, C = System> {
    entries: Arc<DashMap<CacheKey, Entry<V>>>,
    next_purge: Arc<AtomicU64>,
    clock: C,
}

impl<V> InMemoryCache<V> {
    /// Constructs an empty cache using the system clock
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl<V> Default for InMemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C> InMemoryCache<V, C> {
    /// Constructs an empty cache using the provided clock
    pub fn with_clock(clock: C) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_purge: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }
}

impl<V, C: Clone> Clone for InMemoryCache<V, C> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            next_purge: Arc::clone(&self.next_purge),
            clock: self.clock.clone(),
        }
    }
}

impl<V, C: fmt::Debug> fmt::Debug for InMemoryCache<V, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("entries", &self.entries.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl<V: Clone, C: Clock> InMemoryCache<V, C> {
    /// Gets an unexpired value
    pub fn get_value(&self, key: &CacheKeyRef) -> Option<V> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at <= now);
        }

        None
    }

    /// Stores a value for `ttl`
    pub fn set_value(&self, key: &CacheKeyRef, value: V, ttl: DurationSecs) {
        let now = self.clock.now();
        self.purge_expired(now);

        let expires_at = now + ttl;
        self.entries
            .insert(key.to_owned(), Entry { value, expires_at });
    }

    /// Removes a value
    pub fn remove_value(&self, key: &CacheKeyRef) {
        self.entries.remove(key);
    }

    /// Drops every expired entry, at most once per [`PURGE_INTERVAL`]
    fn purge_expired(&self, now: UnixTime) {
        let due = self.next_purge.load(Ordering::Acquire);
        if now.0 < due {
            return;
        }

        let next = (now + PURGE_INTERVAL).0;
        if self
            .next_purge
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let before = self.entries.len();
            self.entries.retain(|_, entry| now < entry.expires_at);
            tracing::trace!(
                purged = before.saturating_sub(self.entries.len()),
                "purged expired cache entries"
            );
        }
    }
}

#[async_trait]
impl<V, C> CacheStore<V> for InMemoryCache<V, C>
where
    V: Clone + Send + Sync + 'static,
    C: Clock + Send + Sync,
{
    async fn get(&self, key: &CacheKeyRef) -> Result<Option<V>, BoxError> {
        Ok(self.get_value(key))
    }

    async fn set(&self, key: &CacheKeyRef, value: V, ttl: DurationSecs) -> Result<(), BoxError> {
        self.set_value(key, value, ttl);
        Ok(())
    }

    async fn remove(&self, key: &CacheKeyRef) -> Result<(), BoxError> {
        self.remove_value(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokenward_clock::TestClock;

    use super::*;

    fn key() -> CacheKey {
        CacheKey::from_static("test::key")
    }

    #[test]
    fn values_expire_after_ttl() {
        let clock = TestClock::new(UnixTime(1_000));
        let cache = InMemoryCache::with_clock(clock.clone());

        cache.set_value(&key(), "value", DurationSecs(60));
        assert_eq!(cache.get_value(&key()), Some("value"));

        clock.inc(59);
        assert_eq!(cache.get_value(&key()), Some("value"));

        clock.inc(1);
        assert_eq!(cache.get_value(&key()), None);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn zero_ttl_is_never_served() {
        let cache = InMemoryCache::with_clock(TestClock::new(UnixTime(1_000)));
        cache.set_value(&key(), 1, DurationSecs::ZERO);
        assert_eq!(cache.get_value(&key()), None);
    }

    #[test]
    fn writes_sweep_out_entries_that_are_never_read_again() {
        let clock = TestClock::new(UnixTime(1_000));
        let cache = InMemoryCache::with_clock(clock.clone());

        for page in 0..1_000 {
            let key = CacheKey::new(format!("nonce::GET::https://api.example.com/users/{}", page));
            cache.set_value(&key, page, DurationSecs(3_600));
        }
        assert_eq!(cache.entries.len(), 1_000);

        clock.inc(7_200);
        cache.set_value(&key(), 1_000, DurationSecs(3_600));

        assert_eq!(cache.entries.len(), 1);
        assert_eq!(cache.get_value(&key()), Some(1_000));
    }

    #[test]
    fn sweeps_keep_live_entries() {
        let clock = TestClock::new(UnixTime(1_000));
        let cache = InMemoryCache::with_clock(clock.clone());
        let short = CacheKey::from_static("test::short");
        let long = CacheKey::from_static("test::long");

        cache.set_value(&short, 1, DurationSecs(30));
        cache.set_value(&long, 2, DurationSecs(600));

        clock.inc(120);
        cache.set_value(&key(), 3, DurationSecs(60));

        assert_eq!(cache.entries.len(), 2);
        assert_eq!(cache.get_value(&long), Some(2));
        assert_eq!(cache.get_value(&short), None);
    }

    #[test]
    fn clones_share_entries() {
        let cache = InMemoryCache::with_clock(TestClock::new(UnixTime(1_000)));
        let other = cache.clone();
        cache.set_value(&key(), 1, DurationSecs(10));
        assert_eq!(other.get_value(&key()), Some(1));

        other.remove_value(&key());
        assert_eq!(cache.get_value(&key()), None);
    }
}
