//! Bounded retry wrapper for calls into the container runtime.
//!
//! The state machines themselves stay retry-free; callers wrap the whole
//! operation and decide, via a predicate, which error classes earn another
//! attempt.

use crate::error::{DockhandError, Result};
use std::future::Future;
use tracing::warn;

/// Run `op` up to `max_attempts` times, retrying only when `is_retryable`
/// accepts the error. The final error is returned unmodified.
pub async fn with_retry<T, F, Fut, P>(max_attempts: u32, is_retryable: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&DockhandError) -> bool,
{
    debug_assert!(max_attempts >= 1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                warn!(attempt, error = %err, "Retrying after recoverable failure");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> DockhandError {
        DockhandError::TransientRuntime { reason: "i/o timeout".into() }
    }

    #[tokio::test]
    async fn test_succeeds_after_one_retry() {
        let calls = AtomicU32::new(0);
        let result = with_retry(2, DockhandError::is_transient, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(transient()) } else { Ok(n) } }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_transient_failure_is_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(2, DockhandError::is_transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(3, DockhandError::is_transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DockhandError::Configuration { reason: "bad manifest".into() }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
