//! Deduplication of concurrent work keyed by name.
//!
//! The first caller for a key starts the work, later callers for the same key attach to the
//! same future and receive a clone of its output. The map only holds weak handles: when every
//! caller waiting on a flight has gone away the flight is dropped, and the next caller starts
//! a fresh one. A flight is therefore never cancelled while someone still waits on it.
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

type Flight<T> = Shared<BoxFuture<'static, T>>;

pub(crate) struct SingleFlight<T> {
    inflight: Mutex<HashMap<String, WeakShared<BoxFuture<'static, T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Runs the future built by `start`, unless a flight for `key` is already in progress,
    /// in which case its output is awaited instead.
    pub(crate) async fn run<F, Fut>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = self.join_or_start(key, start);
        let output = flight.clone().await;
        self.finish(key, &flight);
        output
    }

    /// Number of keys currently being worked on.
    #[cfg(test)]
    pub(crate) fn in_progress(&self) -> usize {
        self.lock()
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    fn join_or_start<F, Fut>(&self, key: &str, start: F) -> Flight<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut inflight = self.lock();

        if let Some(flight) = inflight.get(key).and_then(WeakShared::upgrade) {
            tracing::trace!(key, "joining flight in progress");
            return flight;
        }

        let flight = start().boxed().shared();
        if let Some(weak) = flight.downgrade() {
            inflight.insert(key.to_string(), weak);
        }
        flight
    }

    fn finish(&self, key: &str, flight: &Flight<T>) {
        let mut inflight = self.lock();

        let is_current = inflight
            .get(key)
            .and_then(WeakShared::upgrade)
            .is_none_or(|current| current.ptr_eq(flight));

        if is_current {
            inflight.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WeakShared<BoxFuture<'static, T>>>> {
        // The map is left consistent at every await-free step, so a poisoned lock is still usable.
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
