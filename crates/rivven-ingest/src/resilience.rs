//! Retry and backoff for source I/O and partition acquisition
//!
//! [`RetryConfig`] bounds retries of a single operation (a snapshot page, a
//! stream reopen). [`ExponentialBackoff`] paces a loop that keeps polling
//! (the acquisition loop when no partition is free).

use crate::error::IngestError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry policy with exponential backoff and jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (`0` disables retries)
    max_retries: u32,
    /// Base delay, doubled per attempt
    retry_delay: Duration,
    /// Upper bound on any single delay
    max_delay: Duration,
    /// Jitter factor (0.0 - 1.0)
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Check if another retry is allowed after `attempt` retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            let jitter_range = capped.as_secs_f64() * self.jitter;
            // deterministic spread, golden ratio
            let jitter_offset = (attempt as f64 * 0.618033988749895) % 1.0;
            let jitter_amount = jitter_range * (jitter_offset * 2.0 - 1.0);
            let adjusted = capped.as_secs_f64() + jitter_amount;
            Duration::from_secs_f64(adjusted.max(0.0))
        } else {
            capped
        }
    }

    /// Run `op` until it succeeds, fails with a non-retriable error, or the
    /// retry budget is spent. Returns the value and the retries performed.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> std::result::Result<(T, u32), RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_retriable() && self.should_retry(attempt) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last_error: e,
                    })
                }
            }
        }
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = Some(value);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    /// Set jitter factor (clamped to 0.0 - 1.0).
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

/// Final failure of a retried operation.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Attempts made, including the first
    pub attempts: u32,
    pub last_error: IngestError,
}

/// Doubling delay for polling loops.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        backoff.min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
        assert!(!RetryConfig::builder().max_retries(0).build().should_retry(0));
    }

    #[test]
    fn test_delay_for_attempt_capped() {
        let config = RetryConfig::builder()
            .retry_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .jitter(0.0)
            .build();
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(30), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::builder()
            .retry_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_secs(60))
            .jitter(0.5)
            .build();
        for attempt in 0..5 {
            let nominal = 1000.0 * 2f64.powi(attempt as i32);
            let delay = config.delay_for_attempt(attempt).as_secs_f64() * 1000.0;
            assert!(delay >= nominal * 0.5 - 1.0 && delay <= nominal * 1.5 + 1.0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_errors() {
        let config = RetryConfig::builder().max_retries(3).build();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let (value, retries) = config
            .run("fetch", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(IngestError::source("connection reset"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_budget() {
        let config = RetryConfig::builder().max_retries(2).build();
        let err = config
            .run("fetch", || async {
                Err::<(), _>(IngestError::source("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.last_error, IngestError::Source(_)));
    }

    #[tokio::test]
    async fn test_run_stops_on_permanent_error() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = config
            .run("open", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::history_lost("truncated"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(200));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(400));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(800));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.attempt, 5);
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_millis(100));
    }
}
