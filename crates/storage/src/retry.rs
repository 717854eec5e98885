//! Bounded retry with exponential backoff.

use std::future::Future;

use crate::error::StorageError;
use crate::types::RetrySettings;

/// Run `operation` until it succeeds, fails permanently, or runs out of retries.
///
/// Only errors for which [`StorageError::is_retryable`] is true are retried,
/// at most `settings.max_retries` times, sleeping [`RetrySettings::backoff_for`]
/// between attempts. The last error is returned unchanged.
///
/// # Arguments
/// * `settings` - Retry bound and backoff
/// * `what` - Short operation name for logs
/// * `operation` - Called once per attempt
pub async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    what: &str,
    mut operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut retry: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry < settings.max_retries => {
                retry += 1;
                let delay = settings.backoff_for(retry);
                tracing::warn!(
                    operation = what,
                    retry,
                    max_retries = settings.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
