//! Shared retry helper
//!
//! Bounded attempts with exponential backoff and jitter. Transient errors
//! surface to the caller after the final attempt; nothing here swallows
//! venue responses.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

const MAX_BACKOFF_MS: u64 = 30_000;

/// Retry an async operation up to `attempts` times. `is_retryable` decides
/// whether a given error is worth another attempt; non-retryable errors
/// surface immediately.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    label: &str,
    attempts: u32,
    initial_backoff_ms: u64,
    mut is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut backoff = initial_backoff_ms.max(1);

    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                let jitter = rand::thread_rng().gen_range(0..backoff / 2 + 1);
                warn!(
                    "{} failed (attempt {}/{}): {} - retrying in {}ms",
                    label,
                    attempt,
                    attempts,
                    e,
                    backoff + jitter
                );
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
            Err(e) => {
                debug!("{} giving up after attempt {}: {}", label, attempt, e);
                return Err(e);
            }
        }
    }

    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff("test", 3, 1, |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_backoff("test", 5, 1, |_| false, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
