use std::future::Future;
use std::time::Duration;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 5,
        }
    }
}

impl RetryConfig {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay_secs: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Run `operation` until it succeeds, `classifier` says `Abort`, or
/// `config.max_attempts` calls have been made, sleeping `config.delay()`
/// between calls. The last error is returned on failure.
pub async fn retry_with_delay<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort || attempt >= total_attempts {
                    return Err(e);
                }
                tracing::warn!(
                    attempt,
                    of = total_attempts,
                    error = %e,
                    "Transient failure, retrying in {}s",
                    config.delay_secs
                );
                tokio::time::sleep(config.delay()).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls with `msg`, then returns the call count.
    async fn flaky(calls: &AtomicU32, failures: u32, msg: &str) -> Result<u32, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(msg.to_string())
        } else {
            Ok(n)
        }
    }

    fn always_retry(_: &String) -> RetryAction {
        RetryAction::Retry
    }

    #[test]
    fn test_default_is_three_attempts_five_seconds_apart() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result = retry_with_delay(&RetryConfig::default(), always_retry, || {
            flaky(&calls, 0, "unused")
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abort_stops_after_one_call() {
        let calls = AtomicU32::new(0);
        let result = retry_with_delay(
            &RetryConfig::default(),
            |_: &String| RetryAction::Abort,
            || flaky(&calls, u32::MAX, "fatal"),
        )
        .await;
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_with_delay(&RetryConfig::default(), always_retry, || {
            flaky(&calls, 2, "transient")
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_fixed_pauses() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = retry_with_delay(&RetryConfig::default(), always_retry, || {
            flaky(&calls, u32::MAX, "still failing")
        })
        .await;
        assert_eq!(result.unwrap_err(), "still failing");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two pauses between three attempts.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_no_retry_makes_single_attempt() {
        let calls = AtomicU32::new(0);
        let result = retry_with_delay(&RetryConfig::no_retry(), always_retry, || {
            flaky(&calls, u32::MAX, "nope")
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
