//! Bounded retry with exponential backoff and full jitter for calls to
//! external dependencies (window store, summarizer).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::detect::DetectError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff ceiling for the first retry (milliseconds).
    pub base_delay_ms: u64,
    /// Backoff ceiling cap (milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Upper bound of the sleep before retry number `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Worst-case wall time of [`run`](Self::run) when every attempt takes
    /// up to `per_attempt`: all attempts plus the longest sleep between each.
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let sleeps: Duration = (1..attempts).map(|a| self.ceiling(a)).sum();
        per_attempt.saturating_mul(attempts) + sleeps
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Exhaustion is reported as
    /// [`DetectError::DependencyUnavailable`].
    pub async fn run<T, F, Fut>(&self, dependency: &'static str, mut op: F) -> Result<T, DetectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DetectError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= attempts => {
                    warn!(dependency, attempts, error = %e, "Retries exhausted");
                    return Err(DetectError::DependencyUnavailable {
                        dependency,
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let wait = self.delay(attempt);
                    debug!(dependency, attempt, ?wait, error = %e, "Retrying after transient failure");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Bound `fut` by `limit`, mapping expiry to [`DetectError::DependencyTimeout`].
pub async fn with_timeout<T, Fut>(
    dependency: &'static str,
    limit: Duration,
    fut: Fut,
) -> Result<T, DetectError>
where
    Fut: Future<Output = Result<T, DetectError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DetectError::DependencyTimeout {
            dependency,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
