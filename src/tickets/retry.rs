//! Bounded retry for transient ticket store failures.

use rand::Rng;
use std::{future::Future, time::Duration};
use tracing::warn;

use super::store::StoreError;
use crate::error::CasError;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    attempts: u32,
    base: Duration,
    max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(50),
            max: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = if attempts == 0 { 1 } else { attempts };
        self
    }

    #[must_use]
    pub const fn with_base_delay(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op`, retrying transient failures. Exhaustion or a permanent failure surfaces
    /// as `StoreUnavailable` / `Internal`.
    ///
    /// # Errors
    /// Returns `StoreUnavailable` after the last transient failure.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, CasError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = backoff_delay(attempt, self.base, self.max);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "ticket store failure, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => {
                    warn!(operation, attempt, "ticket store unavailable: {}", err);
                    return Err(CasError::StoreUnavailable);
                }
                Err(err) => return Err(CasError::Internal(err.to_string())),
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
