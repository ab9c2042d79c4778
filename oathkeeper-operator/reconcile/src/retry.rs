//! Bounded retries with exponential backoff for transient collaborator failures.

use std::{fmt, future::Future, time::Duration};
use tracing::{debug, warn};

/// Classifies errors that are worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// Only errors for which [`Transient::is_transient`] holds are retried; the delay between
/// attempts grows by `backoff_multiplier` up to `max_delay`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() {
            debug!(operation = %operation_name, %error, "Operation failed permanently");
            return Err(error);
        }
        if attempt >= max_attempts {
            warn!(operation = %operation_name, attempt, %error, "Operation failed after max retries");
            return Err(error);
        }

        warn!(
            operation = %operation_name,
            attempt,
            %error,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
        delay = (delay * config.backoff_multiplier).min(config.max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let count = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let res = retry_with_backoff(&RetryConfig::default(), "op", || async {
            if count.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError::Flaky)
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(res, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // 500ms + 1s of backoff.
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let count = AtomicU32::new(0);
        let res: Result<(), _> = retry_with_backoff(&RetryConfig::default(), "op", || async {
            count.fetch_add(1, Ordering::SeqCst);
            Err(TestError::Flaky)
        })
        .await;

        assert_eq!(res, Err(TestError::Flaky));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_permanent_failures() {
        let count = AtomicU32::new(0);
        let res: Result<(), _> =
            retry_with_backoff(&RetryConfig::with_max_attempts(3), "op", || async {
                count.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Broken)
            })
            .await;

        assert_eq!(res, Err(TestError::Broken));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn caps_backoff_delay() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2,
        };
        let start = tokio::time::Instant::now();
        let res: Result<(), _> =
            retry_with_backoff(&config, "op", || async { Err(TestError::Flaky) }).await;

        assert_eq!(res, Err(TestError::Flaky));
        // 4s, then 5s twice.
        assert_eq!(start.elapsed(), Duration::from_secs(14));
    }
}
