//! Fixed-delay retry for transient database errors.
//!
//! Only errors classified as transient by `StoreError::is_transient` are
//! retried; everything else is returned on first failure.

use crate::config::DatabaseSettings;
use crate::error::StoreError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(200),
        }
    }
}

impl From<&DatabaseSettings> for StoreRetryPolicy {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

/// Run `f` until it succeeds, fails permanently, or exhausts the retry bound
pub async fn with_store_retry<T, F, Fut>(
    policy: &StoreRetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;

                if !err.is_transient() {
                    return Err(err);
                }

                if attempt > policy.max_retries {
                    warn!("[Retry] {} failed after {} attempts: {}", operation, attempt, err);
                    return Err(StoreError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }

                debug!(
                    "[Retry] {} attempt {}/{} failed ({}), retrying in {:?}",
                    operation,
                    attempt,
                    policy.max_retries + 1,
                    err,
                    policy.delay
                );
                sleep(policy.delay).await;
            }
        }
    }
}
