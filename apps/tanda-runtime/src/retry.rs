use std::future::Future;
use std::time::Duration;

use tanda_core::EngineError;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after a stale-version conflict.
    pub conflict_retry_limit: u32,
    /// Extra attempts after `StoreUnavailable`, idempotent operations only.
    pub store_retry_limit: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            conflict_retry_limit: 3,
            store_retry_limit: 2,
            base_backoff_ms: 20,
            max_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Re-running from a fresh read cannot double-apply.
    Idempotent,
    NotIdempotent,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            conflict_retry_limit: config.conflict_retry_limit,
            store_retry_limit: config.store_retry_limit,
            base_backoff_ms: config.store_retry_backoff_ms,
            max_backoff_ms: config.store_retry_backoff_ms.saturating_mul(10),
        }
    }

    #[must_use]
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let capped_attempt = attempt.min(8);
        let multiplier = 1_u64 << capped_attempt;
        let backoff = self.base_backoff_ms.saturating_mul(multiplier);
        backoff.min(self.max_backoff_ms)
    }

    /// Runs `attempt` until it succeeds or fails with a non-retryable error.
    /// Every attempt must start from a fresh read, so a retried commit
    /// re-evaluates its guards against the latest state.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        idempotency: Idempotency,
        mut attempt: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut conflicts = 0_u32;
        let mut store_failures = 0_u32;
        loop {
            match attempt().await {
                Err(EngineError::Conflict(reason)) if conflicts < self.conflict_retry_limit => {
                    conflicts += 1;
                    tracing::debug!(operation, attempt = conflicts, %reason, "retrying after version conflict");
                }
                Err(EngineError::Conflict(reason)) => {
                    tracing::warn!(operation, attempts = conflicts + 1, %reason, "conflict retries exhausted");
                    return Err(EngineError::Conflict(reason));
                }
                Err(error)
                    if error.is_retryable()
                        && idempotency == Idempotency::Idempotent
                        && store_failures < self.store_retry_limit =>
                {
                    let delay = self.backoff_ms(store_failures);
                    store_failures += 1;
                    tracing::warn!(operation, attempt = store_failures, delay_ms = delay, reason = %error, "store unavailable, backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                other => return other,
            }
        }
    }
}
