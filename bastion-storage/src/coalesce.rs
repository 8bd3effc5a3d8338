//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight future.
//! The registry only holds a weak handle; the strong handles belong to the
//! waiting callers. The registered future owns a guard that removes its
//! entry when the future is dropped, which happens when it completes or
//! when every waiter has been cancelled.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bastion_core::{MetricsStore, METRIC_COALESCED};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};

type SharedOp<T> = Shared<BoxFuture<'static, T>>;

struct Slot<T> {
    id: u64,
    future: WeakShared<BoxFuture<'static, T>>,
}

/// Deduplicates concurrent operations by key.
pub struct RequestCoalescer<T> {
    name: &'static str,
    inflight: Arc<DashMap<String, Slot<T>>>,
    next_id: AtomicU64,
    metrics: Option<Arc<MetricsStore>>,
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `operation` for `key`, or join the run already in flight.
    ///
    /// Every caller that joins a run observes that run's output.
    pub async fn coalesce<F, Fut>(&self, key: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.join_or_start(key, operation).await
    }

    /// Number of keys with a run in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    fn join_or_start<F, Fut>(&self, key: &str, operation: F) -> SharedOp<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Some(shared) = occupied.get().future.upgrade() {
                    self.note_joined();
                    return shared;
                }
                // Every waiter of the previous run was dropped before its
                // guard got to the map; take the slot over.
                let (slot, shared) = self.start(key, operation);
                match slot {
                    Some(slot) => {
                        occupied.insert(slot);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                shared
            }
            Entry::Vacant(vacant) => {
                let (slot, shared) = self.start(key, operation);
                if let Some(slot) = slot {
                    vacant.insert(slot);
                }
                shared
            }
        }
    }

    fn start<F, Fut>(&self, key: &str, operation: F) -> (Option<Slot<T>>, SharedOp<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
            key: key.to_string(),
            id,
        };
        let shared = async move {
            let _guard = guard;
            operation().await
        }
        .boxed()
        .shared();

        // `downgrade` only fails once the run has produced its output, which
        // an unpolled future cannot have done.
        let slot = shared.downgrade().map(|future| Slot { id, future });
        (slot, shared)
    }

    fn note_joined(&self) {
        tracing::debug!(operation = self.name, "Joined in-flight operation");
        if let Some(metrics) = &self.metrics {
            metrics.inc_counter(METRIC_COALESCED, &[("operation", self.name)]);
        }
    }
}

impl<T> std::fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("name", &self.name)
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

/// Removes its registry entry when the owning future is dropped, unless a
/// newer run has already taken the slot.
struct InflightGuard<T> {
    inflight: Arc<DashMap<String, Slot<T>>>,
    key: String,
    id: u64,
}

impl<T> Drop for InflightGuard<T> {
    fn drop(&mut self) {
        self.inflight.remove_if(&self.key, |_, slot| slot.id == self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let coalescer = RequestCoalescer::<u32>::new("test");
        let runs = Arc::new(AtomicU32::new(0));

        let calls = (0..8).map(|_| {
            let runs = runs.clone();
            coalescer.coalesce("k", move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                42
            })
        });
        let results = join_all(calls).await;

        assert_eq!(results, vec![42; 8]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reaches_every_waiter() {
        let coalescer = RequestCoalescer::<Result<u32, String>>::new("test");
        let calls = (0..4).map(|_| {
            coalescer.coalesce("k", || async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Err("backend exploded".to_string())
            })
        });
        for result in join_all(calls).await {
            assert_eq!(result, Err("backend exploded".to_string()));
        }
        assert!(!coalescer.is_in_flight("k"));
    }

    #[tokio::test]
    async fn test_completed_run_is_not_reused() {
        let coalescer = RequestCoalescer::<u32>::new("test");
        assert_eq!(coalescer.coalesce("k", || async { 1 }).await, 1);
        assert_eq!(coalescer.coalesce("k", || async { 2 }).await, 2);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let coalescer = RequestCoalescer::<String>::new("test");
        let runs = Arc::new(AtomicU32::new(0));
        let calls = ["a", "b", "a", "c"].into_iter().map(|key| {
            let runs = runs.clone();
            coalescer.coalesce(key, move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                key.to_uppercase()
            })
        });
        let results = join_all(calls).await;
        assert_eq!(results, vec!["A", "B", "A", "C"]);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiters_release_the_key() {
        let coalescer = RequestCoalescer::<u32>::new("test");
        let stalled = coalescer.coalesce("k", || std::future::pending::<u32>());
        assert!(tokio::time::timeout(Duration::from_millis(5), stalled)
            .await
            .is_err());
        assert_eq!(coalescer.in_flight(), 0);

        assert_eq!(coalescer.coalesce("k", || async { 9 }).await, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_waiters_are_counted() {
        let metrics = Arc::new(MetricsStore::default());
        let coalescer = RequestCoalescer::<u32>::new("l2_get").with_metrics(metrics.clone());
        let calls = (0..3).map(|_| {
            coalescer.coalesce("k", || async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                1
            })
        });
        join_all(calls).await;
        assert_eq!(
            metrics.get_counter(METRIC_COALESCED, &[("operation", "l2_get")]),
            2.0
        );
    }
}
