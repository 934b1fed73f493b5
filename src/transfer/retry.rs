//! Bounded exponential backoff / 有界指数退避

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::PartError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one / 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before the retry following failed attempt `attempt` (1-based).
    /// Equal jitter: uniformly drawn from `[ceiling / 2, ceiling]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_millis(half + jitter)
    }

    /// Capped exponential backoff before jitter, in milliseconds / 退避上限
    fn backoff_ceiling(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Returns the last error / 按策略重试
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, PartError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, PartError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
