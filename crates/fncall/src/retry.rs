//! Retry and timeout wrappers composed at the call site.
//!
//! [`with_retry`] re-runs a fallible async operation with exponential backoff
//! while a caller-supplied predicate says the failure is worth retrying.
//! [`with_timeout`] races an operation against a timer.

use crate::error::TimeoutError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff policy for [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Re-executions after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a fixed per-attempt factor.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sleep before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());
        if !self.jitter {
            return Duration::from_secs_f64(secs);
        }
        // Fixed factors keep schedules reproducible in tests.
        const FACTORS: [f64; 4] = [0.8, 0.95, 0.7, 0.9];
        Duration::from_secs_f64(secs * FACTORS[retry as usize % FACTORS.len()])
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// retry budget is spent. Returns the last outcome.
///
/// `op` receives the zero-based attempt number.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= config.max_retries || !should_retry(&error) {
            return Err(error);
        }
        let delay = config.backoff(attempt);
        attempt += 1;
        warn!(
            "Attempt {attempt}/{} failed: {error}; retrying in {}ms",
            config.max_retries + 1,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}

/// Race `fut` against a timer. When the timer wins the future is dropped and
/// [`TimeoutError`] is returned.
pub async fn with_timeout<T, Fut>(duration: Duration, fut: Fut) -> Result<T, TimeoutError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| TimeoutError(duration))
}
