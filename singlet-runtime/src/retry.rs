//! Exponential-backoff retry for transient backend errors. Shared by the
//! batch/cache context (reads) and the mutation pipeline (writes) —
//! conditional and transaction-cancellation failures are never retried,
//! only `BackendError::Transient`.

use crate::backend::BackendError;
use singlet_core::RetryConfig;
use std::future::Future;

pub(crate) async fn retry_transient<T, F, Fut>(retry: &RetryConfig, mut f: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < retry.max_attempts => {
                tokio::time::sleep(retry.backoff_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
