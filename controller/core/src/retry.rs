//! Fixed-delay retries for Kubernetes API calls.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::{fmt, future::Future};
use tokio::time;

/// How many times an operation is attempted, and how long to wait between
/// attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: time::Duration,
}

/// Classifies errors for [`retry`]. Errors that return `None` are not retried.
pub trait Recoverable {
    fn retry_reason(&self) -> Option<&'static str>;
}

#[derive(Clone, Debug, Default)]
pub struct RetryMetrics {
    retries: Family<RetryLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RetryLabels {
    reason: &'static str,
}

// === impl RetryPolicy ===

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: time::Duration) -> Self {
        Self { attempts, delay }
    }

    /// A single attempt with no delay.
    pub const fn once() -> Self {
        Self::new(1, time::Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, time::Duration::from_secs(1))
    }
}

// === impl RetryMetrics ===

impl RetryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let retries = Family::default();
        reg.register(
            "retry",
            "Number of Kubernetes API operations retried, by reason",
            retries.clone(),
        );
        Self { retries }
    }

    pub fn retried(&self, reason: &'static str) {
        self.retries.get_or_create(&RetryLabels { reason }).inc();
    }

    #[cfg(test)]
    pub(crate) fn retry_count(&self, reason: &'static str) -> u64 {
        self.retries.get_or_create(&RetryLabels { reason }).get()
    }
}

/// Runs `op` until it succeeds, fails with an unrecoverable error, or the
/// policy's attempts are exhausted. Only the last error is returned.
///
/// `op` is passed the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    metrics: &RetryMetrics,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Recoverable + fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let Some(reason) = error.retry_reason() else {
            tracing::debug!(%operation, %error, "Unrecoverable error, not retrying");
            return Err(error);
        };
        if attempt >= attempts {
            tracing::debug!(%operation, %error, attempt, "Retries exhausted");
            return Err(error);
        }

        tracing::debug!(%operation, %error, attempt, reason, "Retrying");
        metrics.retried(reason);
        if !policy.delay.is_zero() {
            time::sleep(policy.delay).await;
        }
        attempt += 1;
    }
}
