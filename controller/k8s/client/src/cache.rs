//! Waits for the informer cache to observe a write.

use kube::runtime::reflector::{ObjectRef, Store};
use prometheus_client::{
    metrics::{
        counter::Counter,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use startup_scaler_controller_k8s_api::{Pod, ResourceExt, ResourceId};
use tokio::time;

pub const DEFAULT_TIMEOUT: time::Duration = time::Duration::from_secs(3);
pub const DEFAULT_POLL_STEP: time::Duration = time::Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct CacheSync {
    cache: Store<Pod>,
    timeout: time::Duration,
    step: time::Duration,
    metrics: CacheSyncMetrics,
}

#[derive(Clone, Debug)]
pub struct CacheSyncMetrics {
    sync_timeout: Counter,
    sync_poll: Histogram,
}

// === impl CacheSync ===

impl CacheSync {
    pub fn new(cache: Store<Pod>, metrics: CacheSyncMetrics) -> Self {
        Self {
            cache,
            timeout: DEFAULT_TIMEOUT,
            step: DEFAULT_POLL_STEP,
            metrics,
        }
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_step(mut self, step: time::Duration) -> Self {
        self.step = step;
        self
    }

    /// Polls the cache until it holds `id` at `resource_version` (or later).
    /// Returns false if the timeout elapses first.
    pub async fn wait(&self, id: &ResourceId, resource_version: &str) -> bool {
        let key = ObjectRef::<Pod>::new(&id.name).within(&id.namespace);
        let deadline = time::Instant::now() + self.timeout;
        let mut polls = 0u32;
        loop {
            polls += 1;
            let cached = self.cache.get(&key);
            let observed = cached
                .as_ref()
                .and_then(|pod| pod.resource_version())
                .is_some_and(|cached| is_observed(&cached, resource_version));
            if observed {
                tracing::trace!(namespace = %id.namespace, name = %id.name, polls, "Cache observed write");
                self.metrics.sync_poll.observe(polls.into());
                return true;
            }

            let now = time::Instant::now();
            if now >= deadline {
                tracing::warn!(
                    namespace = %id.namespace,
                    name = %id.name,
                    %resource_version,
                    timeout = ?self.timeout,
                    "Timed out waiting for the informer cache",
                );
                self.metrics.sync_timeout.inc();
                return false;
            }
            time::sleep(self.step.min(deadline - now)).await;
        }
    }
}

/// Resource versions are opaque, but the API server issues them from a
/// monotonic counter. A cache that has moved past the write has observed it.
fn is_observed(cached: &str, written: &str) -> bool {
    if cached == written {
        return true;
    }
    match (cached.parse::<u64>(), written.parse::<u64>()) {
        (Ok(cached), Ok(written)) => cached > written,
        _ => false,
    }
}

// === impl CacheSyncMetrics ===

impl Default for CacheSyncMetrics {
    fn default() -> Self {
        Self {
            sync_timeout: Counter::default(),
            sync_poll: Histogram::new(exponential_buckets(1.0, 2.0, 8)),
        }
    }
}

impl CacheSyncMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "sync_timeout",
            "Count of writes the informer cache did not observe in time",
            metrics.sync_timeout.clone(),
        );
        reg.register(
            "sync_poll",
            "Number of cache polls needed to observe a write",
            metrics.sync_poll.clone(),
        );
        metrics
    }

    #[cfg(test)]
    pub(crate) fn timeout_count(&self) -> u64 {
        self.sync_timeout.get()
    }
}
