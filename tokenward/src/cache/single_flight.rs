use std::{fmt, future::Future, sync::Arc};

use dashmap::DashMap;
use tokio::sync::OnceCell;

use super::{CacheKey, CacheKeyRef};

/// Coalesces concurrent operations that share a key
///
/// The first caller for a key runs the operation; callers arriving while it
/// is in flight wait for and share its result. Once the operation completes
/// its entry is removed, so the next caller starts a new operation. If the
/// running caller is cancelled, one of the waiters runs the operation in its
/// place.
pub struct SingleFlight<T> {
    in_flight: DashMap<CacheKey, Arc<OnceCell<T>>>,
}

impl<T> SingleFlight<T> {
    /// Constructs an empty coordinator
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }

    /// The number of keys with an operation currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl<T: Clone> SingleFlight<T> {
    /// Runs `operation` unless one is already in flight for `key`,
    /// returning the shared result either way
    pub async fn run<F, Fut>(&self, key: &CacheKeyRef, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = self
            .in_flight
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let result = cell
            .get_or_init(|| async {
                let result = operation().await;
                self.in_flight
                    .remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
                result
            })
            .await;

        result.clone()
    }
}
