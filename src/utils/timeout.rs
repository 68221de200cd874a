//! Async timeout wrappers.
//!
//! Every suspension point in the background loops is bounded by one of
//! these; a timer that fires maps onto `CommError::Timeout` so callers can
//! distinguish "no data yet" from real failures.

use crate::error::{CommError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for connect/send/receive operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop()` waits for loops to wind down
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling step used by `dequeue_wait`
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Run a future under a deadline, mapping expiry to `CommError::Timeout`.
pub async fn with_timeout_error<F>(future: F, duration: Duration) -> Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| CommError::Timeout)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_deadline() {
        let out = with_timeout_error(async { 7 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn expiry_maps_to_timeout() {
        let result = with_timeout_error(
            tokio::time::sleep(Duration::from_secs(5)),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(CommError::Timeout)));
    }
}
