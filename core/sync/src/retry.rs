//! In-pass upload retries with capped exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use meterline_common::{Error, Result};

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How often, and how patiently, one upload is retried within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further one.
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Backoff before retry number `retry` (0-based), without jitter.
    fn backoff(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
    }

    /// Backoff with +/- 25% jitter.
    fn jittered_backoff(&self, retry: u32) -> Duration {
        self.backoff(retry).mul_f64(0.75 + rand::random::<f64>() * 0.5)
    }

    /// Run `upload`, retrying transient failures until the budget is spent.
    ///
    /// Permanent failures and the last transient one are returned as is.
    pub async fn run<F, Fut, T>(&self, upload: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;

        loop {
            match upload().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("Upload succeeded after {} retries", retry);
                    }
                    return Ok(value);
                }
                Err(err) if retry < self.max_retries && is_retryable(&err) => {
                    let delay = self.jittered_backoff(retry);
                    retry += 1;
                    warn!("Upload attempt {} failed: {}. Retrying in {:?}", retry, err, delay);
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Transient failures: transport errors, timeouts, throttling and 5xx.
pub fn is_retryable(err: &Error) -> bool {
    match err {
        Error::Network(_) => true,
        Error::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn http(status: u16) -> Error {
        Error::Http {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));

        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), MAX_BACKOFF);
        assert_eq!(policy.backoff(40), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::new(3, Duration::from_millis(400));
        for _ in 0..50 {
            let delay = policy.jittered_backoff(1);
            assert!(delay >= Duration::from_millis(599));
            assert!(delay <= Duration::from_millis(1001));
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&Error::Network("reset".to_string())));
        assert!(is_retryable(&http(503)));
        assert!(is_retryable(&http(429)));
        assert!(!is_retryable(&http(404)));
        assert!(!is_retryable(&Error::Codec("bad".to_string())));
        assert!(!is_retryable(&Error::Serialization("bad ack".to_string())));
    }

    #[tokio::test]
    async fn test_zero_budget_makes_single_attempt() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = RetryPolicy::new(0, Duration::from_millis(1))
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("Always fails".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = RetryPolicy::new(3, Duration::from_millis(1))
            .run(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(http(502))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejected_upload_not_retried() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = RetryPolicy::new(3, Duration::from_millis(1))
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Http {
                    status: 400,
                    message: "Missing required fields".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(Error::Http { status: 400, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = RetryPolicy::new(2, Duration::from_millis(1))
            .run(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("Always fails".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
