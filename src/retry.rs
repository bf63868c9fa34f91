//! Bounded exponential backoff shared by clones, uploads and API calls

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::config::RetryConfig;

impl RetryConfig {
    /// Exponential backoff with jitter; `max_attempts` counts the first try
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)))
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
    }
}

/// Run `operation`, retrying while `is_retryable` holds and attempts remain
///
/// `label` names the operation in debug logs and must not contain secrets.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryConfig,
    label: &str,
    operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: FnMut(&E) -> bool,
{
    let attempt = AtomicUsize::new(1);

    operation
        .retry(policy.backoff())
        .when(is_retryable)
        .notify(|err, dur| {
            let current = attempt.fetch_add(1, Ordering::SeqCst);
            debug!(
                "{} failed (attempt {}), retrying in {:?}: {}",
                label, current, dur, err
            );
        })
        .await
}

/// Whether an HTTP status means "slow down and try again"
pub fn is_throttled(status: u16) -> bool {
    status == 429 || status == 503
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_policy(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<&str, String> = with_retry(
            &fast_policy(3),
            "flaky op",
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = with_retry(
            &fast_policy(2),
            "always failing op",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        // Never sleeps, so no runtime timer is needed
        let result: Result<(), String> = tokio_test::block_on(with_retry(
            &fast_policy(5),
            "auth op",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("401".to_string())
                }
            },
            |e| e != "401",
        ));

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_throttled() {
        assert!(is_throttled(429));
        assert!(is_throttled(503));
        assert!(!is_throttled(401));
        assert!(!is_throttled(500));
    }
}
