use dashmap::DashMap;
use tokenward_clock::{DurationSecs, UnixTime};

use super::{CacheKey, CacheKeyRef};

/// Learns how long tokens for each cache key should be cached
///
/// Once a token has been issued for a key, later tokens for that key are
/// cached for as long as that token lived, less a buffer.
#[derive(Debug, Default)]
pub struct CacheDurationTuner {
    durations: DashMap<CacheKey, DurationSecs>,
}

impl CacheDurationTuner {
    /// Constructs an empty tuner
    pub fn new() -> Self {
        Self::default()
    }

    /// The learned cache duration for `key`, if any
    pub fn duration(&self, key: &CacheKeyRef) -> Option<DurationSecs> {
        self.durations.get(key).map(|d| *d)
    }

    /// Records the lifetime of a token issued at `now`, returning the
    /// duration it should be cached for
    ///
    /// Tokens that never expire do not teach the tuner anything, so they are
    /// not recorded and `None` is returned.
    pub fn record(
        &self,
        key: &CacheKeyRef,
        expiration: UnixTime,
        now: UnixTime,
        buffer: DurationSecs,
    ) -> Option<DurationSecs> {
        if expiration.is_max() {
            return None;
        }

        let duration = (expiration - now).saturating_sub(buffer);
        self.durations.insert(key.to_owned(), duration);
        Some(duration)
    }
}
