//! Retry policy for transient connection failures.

use crate::config::PoolOptions;
use crate::error::DbResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-delay retry of retryable errors.
///
/// An operation runs at most `1 + max_retries` times. Only errors for which
/// `DbError::is_retryable()` holds are retried; after the last attempt the
/// final error is returned unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&PoolOptions::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn from_options(options: &PoolOptions) -> Self {
        Self::new(
            options.max_retries_or_default(),
            options.retry_delay_or_default(),
        )
    }

    /// Run `operation`, retrying retryable failures.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
