use std::{fmt, future::Future, sync::Arc};

use tokenward_clock::{Clock, DurationSecs, System};

use super::{CacheKeyRef, CacheStore, InMemoryCache, SingleFlight};

/// The result of asking a factory for a value to cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome<V, E> {
    /// A value which should be cached for `ttl`
    Fresh {
        /// The value
        value: V,
        /// How long to cache the value
        ttl: DurationSecs,
    },
    /// A failure, which is returned to every waiting caller but never cached
    Failed(E),
}

/// Whether a lookup may be served from the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheRead {
    /// Serve a cached value if one exists
    Allow,
    /// Always invoke the factory
    Bypass,
}

/// Caching limits applied when storing an entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheEntryOptions {
    /// An upper bound on how long the local tier keeps entries
    pub local_expiration: Option<DurationSecs>,
    /// How long entries found in the distributed tier are kept locally
    pub ttl: DurationSecs,
}

impl CacheEntryOptions {
    fn local_ttl(&self, ttl: DurationSecs) -> DurationSecs {
        match self.local_expiration {
            Some(limit) if limit < ttl => limit,
            _ => ttl,
        }
    }
}

/// A two-tier cache which coalesces concurrent misses
///
/// Values are always cached in process. When a distributed store is
/// configured, values are also written there and read from there on a local
/// miss. Distributed store failures are logged and otherwise ignored.
pub struct TokenCache<V, E, C = System> {
    local: InMemoryCache<V, C>,
    distributed: Option<Arc<dyn CacheStore<V>>>,
    flights: SingleFlight<Result<V, E>>,
}

impl<V, E> TokenCache<V, E> {
    /// Constructs a cache with only a local tier, using the system clock
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl<V, E> Default for TokenCache<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E, C> TokenCache<V, E, C> {
    /// Constructs a cache with only a local tier, using the provided clock
    pub fn with_clock(clock: C) -> Self {
        Self {
            local: InMemoryCache::with_clock(clock),
            distributed: None,
            flights: SingleFlight::new(),
        }
    }

    /// Adds a distributed tier
    pub fn with_distributed(mut self, store: Arc<dyn CacheStore<V>>) -> Self {
        self.distributed = Some(store);
        self
    }
}

impl<V, E, C: fmt::Debug> fmt::Debug for TokenCache<V, E, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("local", &self.local)
            .field("distributed", &self.distributed.is_some())
            .field("flights", &self.flights)
            .finish()
    }
}

impl<V, E, C> TokenCache<V, E, C>
where
    V: Clone + Send + Sync + 'static,
    E: Clone,
    C: Clock,
{
    /// Gets a cached value, falling back to the distributed tier
    pub async fn get(&self, key: &CacheKeyRef, options: &CacheEntryOptions) -> Option<V> {
        if let Some(value) = self.local.get_value(key) {
            tracing::trace!(cache.key = %key, "local cache hit");
            return Some(value);
        }

        let distributed = self.distributed.as_ref()?;
        match distributed.get(key).await {
            Ok(Some(value)) => {
                tracing::trace!(cache.key = %key, "distributed cache hit");
                self.local
                    .set_value(key, value.clone(), options.local_ttl(options.ttl));
                Some(value)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(cache.key = %key, error = %error, "unable to read from distributed cache");
                None
            }
        }
    }

    /// Stores a value in every tier
    pub async fn set(&self, key: &CacheKeyRef, value: V, ttl: DurationSecs, options: &CacheEntryOptions) {
        if let Some(distributed) = &self.distributed {
            if let Err(error) = distributed.set(key, value.clone(), ttl).await {
                tracing::warn!(cache.key = %key, error = %error, "unable to write to distributed cache");
            }
        }

        self.local.set_value(key, value, options.local_ttl(ttl));
    }

    /// Removes a value from every tier
    pub async fn remove(&self, key: &CacheKeyRef) {
        self.local.remove_value(key);

        if let Some(distributed) = &self.distributed {
            if let Err(error) = distributed.remove(key).await {
                tracing::warn!(cache.key = %key, error = %error, "unable to remove from distributed cache");
            }
        }
    }

    /// Gets a cached value or creates one with `factory`
    ///
    /// Concurrent calls for the same key share a single invocation of the
    /// factory, and all of them observe its result. Only fresh values are
    /// cached; they are stored before any caller is released.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &CacheKeyRef,
        read: CacheRead,
        options: &CacheEntryOptions,
        factory: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchOutcome<V, E>>,
    {
        if read == CacheRead::Allow {
            if let Some(value) = self.get(key, options).await {
                return Ok(value);
            }
        }

        self.flights
            .run(key, || async {
                // An earlier flight, here or in another process, may have
                // landed since the lookup above
                if read == CacheRead::Allow {
                    if let Some(value) = self.get(key, options).await {
                        return Ok(value);
                    }
                }

                match factory().await {
                    FetchOutcome::Fresh { value, ttl } => {
                        self.set(key, value.clone(), ttl, options).await;
                        Ok(value)
                    }
                    FetchOutcome::Failed(error) => Err(error),
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokenward_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{cache::CacheKey, error::BoxError};

    fn key() -> CacheKey {
        CacheKey::from_static("layered")
    }

    fn options() -> CacheEntryOptions {
        CacheEntryOptions {
            local_expiration: None,
            ttl: DurationSecs(300),
        }
    }

    fn cache(clock: &TestClock) -> TokenCache<u32, String, TestClock> {
        TokenCache::with_clock(clock.clone())
    }

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl CacheStore<u32> for BrokenStore {
        async fn get(&self, _: &CacheKeyRef) -> Result<Option<u32>, BoxError> {
            Err("store offline".into())
        }

        async fn set(&self, _: &CacheKeyRef, _: u32, _: DurationSecs) -> Result<(), BoxError> {
            Err("store offline".into())
        }

        async fn remove(&self, _: &CacheKeyRef) -> Result<(), BoxError> {
            Err("store offline".into())
        }
    }

    /// A shared store which another process fills right after the first read
    #[derive(Debug, Default)]
    struct FilledByAnotherProcess {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore<u32> for FilledByAnotherProcess {
        async fn get(&self, _: &CacheKeyRef) -> Result<Option<u32>, BoxError> {
            match self.reads.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(None),
                _ => Ok(Some(9)),
            }
        }

        async fn set(&self, _: &CacheKeyRef, _: u32, _: DurationSecs) -> Result<(), BoxError> {
            Ok(())
        }

        async fn remove(&self, _: &CacheKeyRef) -> Result<(), BoxError> {
            Ok(())
        }
    }

    mod when_values_are_fresh {
        use super::*;

        #[tokio::test]
        async fn they_are_served_until_ttl() {
            let clock = TestClock::new(UnixTime(1_000));
            let cache = cache(&clock);
            let fetches = AtomicUsize::new(0);
            let factory = || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                FetchOutcome::Fresh {
                    value: 7,
                    ttl: DurationSecs(60),
                }
            };

            assert_eq!(cache.get_or_create(&key(), CacheRead::Allow, &options(), factory).await, Ok(7));
            clock.inc(59);
            assert_eq!(cache.get_or_create(&key(), CacheRead::Allow, &options(), factory).await, Ok(7));
            assert_eq!(fetches.load(Ordering::SeqCst), 1);

            clock.inc(1);
            assert_eq!(cache.get_or_create(&key(), CacheRead::Allow, &options(), factory).await, Ok(7));
            assert_eq!(fetches.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn bypass_always_fetches() {
            let clock = TestClock::new(UnixTime(1_000));
            let cache = cache(&clock);
            let fetches = AtomicUsize::new(0);
            let factory = || async {
                let n = fetches.fetch_add(1, Ordering::SeqCst) as u32;
                FetchOutcome::Fresh {
                    value: n,
                    ttl: DurationSecs(60),
                }
            };

            assert_eq!(cache.get_or_create(&key(), CacheRead::Allow, &options(), factory).await, Ok(0));
            assert_eq!(cache.get_or_create(&key(), CacheRead::Bypass, &options(), factory).await, Ok(1));
            assert_eq!(cache.get_or_create(&key(), CacheRead::Allow, &options(), factory).await, Ok(1));
        }

        #[tokio::test]
        async fn local_expiration_caps_local_tier() {
            let clock = TestClock::new(UnixTime(1_000));
            let cache = cache(&clock);
            let options = CacheEntryOptions {
                local_expiration: Some(DurationSecs(10)),
                ttl: DurationSecs(300),
            };
            cache.set(&key(), 1, DurationSecs(60), &options).await;

            clock.inc(10);
            assert_eq!(cache.get(&key(), &options).await, None);
        }
    }

    mod when_the_factory_fails {
        use super::*;

        #[tokio::test]
        async fn failures_are_not_cached() {
            let clock = TestClock::new(UnixTime(1_000));
            let cache = cache(&clock);

            let failed = cache
                .get_or_create(&key(), CacheRead::Allow, &options(), || async {
                    FetchOutcome::Failed("unavailable".to_owned())
                })
                .await;
            assert_eq!(failed, Err("unavailable".to_owned()));

            let recovered = cache
                .get_or_create(&key(), CacheRead::Allow, &options(), || async {
                    FetchOutcome::Fresh {
                        value: 3,
                        ttl: DurationSecs(60),
                    }
                })
                .await;
            assert_eq!(recovered, Ok(3));
        }

        #[tokio::test]
        async fn concurrent_callers_share_the_failure() {
            let cache: TokenCache<u32, String> = TokenCache::new();
            let fetches = AtomicUsize::new(0);
            let key = key();
            let options = options();

            let call = || {
                cache.get_or_create(&key, CacheRead::Allow, &options, || async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    FetchOutcome::Failed("denied".to_owned())
                })
            };

            let results = futures::future::join_all((0..4).map(|_| call())).await;
            assert!(results.iter().all(|r| r == &Err("denied".to_owned())));
            assert_eq!(fetches.load(Ordering::SeqCst), 1);
        }
    }

    mod when_the_distributed_tier_is_configured {
        use super::*;

        #[tokio::test]
        async fn local_misses_are_filled_from_it() {
            let clock = TestClock::new(UnixTime(1_000));
            let shared = InMemoryCache::with_clock(clock.clone());
            let first = cache(&clock).with_distributed(Arc::new(shared.clone()));
            let second = cache(&clock).with_distributed(Arc::new(shared));

            first.set(&key(), 42, DurationSecs(60), &options()).await;

            let value = second
                .get_or_create(&key(), CacheRead::Allow, &options(), || async {
                    FetchOutcome::Failed("should not fetch".to_owned())
                })
                .await;
            assert_eq!(value, Ok(42));
        }

        #[tokio::test]
        async fn values_written_by_another_process_are_rechecked_before_fetching() {
            let clock = TestClock::new(UnixTime(1_000));
            let store = Arc::new(FilledByAnotherProcess::default());
            let cache = cache(&clock).with_distributed(store.clone());

            let value = cache
                .get_or_create(&key(), CacheRead::Allow, &options(), || async {
                    FetchOutcome::Failed("should not fetch".to_owned())
                })
                .await;

            assert_eq!(value, Ok(9));
            assert_eq!(store.reads.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        #[tracing_test::traced_test]
        async fn its_failures_are_bypassed() {
            let clock = TestClock::new(UnixTime(1_000));
            let cache = cache(&clock).with_distributed(Arc::new(BrokenStore));

            let value = cache
                .get_or_create(&key(), CacheRead::Allow, &options(), || async {
                    FetchOutcome::Fresh {
                        value: 5,
                        ttl: DurationSecs(60),
                    }
                })
                .await;
            assert_eq!(value, Ok(5));
            assert_eq!(cache.get(&key(), &options()).await, Some(5));
            assert!(logs_contain("unable to write to distributed cache"));
        }

        #[tokio::test]
        async fn removal_clears_both_tiers() {
            let clock = TestClock::new(UnixTime(1_000));
            let shared = InMemoryCache::with_clock(clock.clone());
            let cache = cache(&clock).with_distributed(Arc::new(shared.clone()));

            cache.set(&key(), 1, DurationSecs(60), &options()).await;
            cache.remove(&key()).await;

            assert_eq!(cache.get(&key(), &options()).await, None);
            assert_eq!(shared.get_value(&key()), None);
        }
    }
}
