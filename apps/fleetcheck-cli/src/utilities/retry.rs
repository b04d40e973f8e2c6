//! Bounded retry with exponential backoff for cloud and managed-service
//! calls. Only transient failures (throttling, 5xx, timeouts) are retried;
//! auth and parameter errors fail immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const BACKOFF_START_MILLIS: u64 = 1000;
// Delays are 1s, 2s, 4s for the default three attempts.

const TRANSIENT_MARKERS: &[&str] = &[
    "throttling",
    "requestlimitexceeded",
    "serviceunavailable",
    "internalerror",
    "toomanyrequests",
    "timed out",
    "timeout",
    "429",
    "500",
    "502",
    "503",
    "504",
];

/// Classifies an error message as transient (retryable) or not.
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Runs `op` up to `max_attempts` times, sleeping with exponential backoff
/// between attempts. Non-transient errors are returned immediately.
pub async fn with_backoff<T, E, Fut>(
    label: &str,
    max_attempts: u32,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    E: Display,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay_millis = BACKOFF_START_MILLIS;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_transient(&e.to_string()) => {
                warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {}ms",
                    label, attempt, max_attempts, e, delay_millis
                );
                tokio::time::sleep(Duration::from_millis(delay_millis)).await;
                delay_millis *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_transient_classification() {
        assert!(is_transient("HTTP 503 Service Unavailable"));
        assert!(is_transient("Throttling: rate exceeded"));
        assert!(is_transient("connection timed out"));
        assert!(!is_transient("401 unauthorized"), "auth errors never retry");
        assert!(!is_transient("invalid parameter: metric_name"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("503 service error".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("403 permission denied".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry on permission errors");
    }
}
