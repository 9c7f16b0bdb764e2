//! Token caching with request coalescing
//!
//! Tokens are cached in a local, in-process tier and, optionally, in a
//! distributed tier shared between instances. Concurrent misses for the same
//! key are coalesced so that only one request reaches the authority.

use aliri_braid::braid;
use async_trait::async_trait;
use tokenward_clock::DurationSecs;

use crate::error::BoxError;

mod key;
mod layered;
mod memory;
mod single_flight;
mod tuning;

pub use key::ClientCredentialsCacheKeyGenerator;
pub(crate) use key::hash_segment;
pub use layered::{CacheEntryOptions, CacheRead, FetchOutcome, TokenCache};
pub use memory::InMemoryCache;
pub use single_flight::SingleFlight;
pub use tuning::CacheDurationTuner;

/// A key identifying a cached entry
#[braid(serde)]
pub struct CacheKey;

/// A store for cached values with a time-to-live
///
/// Implementations may be backed by shared infrastructure. Failures are
/// reported to the caller, which logs them and carries on without the cache.
#[async_trait]
pub trait CacheStore<V>: Send + Sync {
    /// Gets the value stored under `key`, if present and not expired
    async fn get(&self, key: &CacheKeyRef) -> Result<Option<V>, BoxError>;

    /// Stores `value` under `key` for `ttl`
    async fn set(&self, key: &CacheKeyRef, value: V, ttl: DurationSecs) -> Result<(), BoxError>;

    /// Removes any value stored under `key`
    async fn remove(&self, key: &CacheKeyRef) -> Result<(), BoxError>;
}
