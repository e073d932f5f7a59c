//! Coalesces concurrent runs of the same keyed async job.
//!
//! While a job for a key is in flight, later callers for that key await the same run instead
//! of starting another. Once it finishes the key is free again, so the next call starts fresh.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ChokePoint<K, V> {
    in_flight: Arc<DashMap<K, InFlight<V>>>,
    next_run: AtomicU64,
}

struct InFlight<V> {
    run: u64,
    future: Shared<BoxFuture<'static, V>>,
}

impl<K, V> Default for ChokePoint<K, V>
where
    K: Clone + Eq + Send + Sync + std::hash::Hash + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ChokePoint<K, V>
where
    K: Clone + Eq + Send + Sync + std::hash::Hash + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_run: AtomicU64::new(0),
        }
    }

    /// Runs `job` for `key`, or joins the run already in flight for it.
    /// `job` is only invoked when this call starts a new run.
    pub async fn run<F, Fut>(&self, key: K, job: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let future = match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().future.clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let run = self.next_run.fetch_add(1, Ordering::Relaxed);
                let in_flight = Arc::clone(&self.in_flight);
                let work = job();
                let future = async move {
                    let value = work.await;
                    // only clear our own run; a newer one may already own the key
                    in_flight.remove_if(&key, |_, current| current.run == run);
                    value
                }
                .boxed()
                .shared();
                entry.insert(InFlight {
                    run,
                    future: future.clone(),
                });
                future
            }
        };

        future.await
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }
}
