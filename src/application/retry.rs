use crate::config::RetryPolicy;
use crate::error::{ExternalError, LedgerError, Result};
use std::future::Future;
use tracing::{debug, warn};

/// Calls an external collaborator, retrying transient failures with
/// exponential backoff.
///
/// Permanent failures and exhausted retries surface as
/// [`LedgerError::ExternalUnavailable`]. Callers must not have changed any
/// ledger state before calling this.
pub async fn call_external<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ExternalError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(%what, attempt, ?delay, error = %err, "external call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(%what, attempt, error = %err, "external call failed");
                return Err(LedgerError::from(err));
            }
        }
    }
}

/// Re-runs `op` when its commit lost an optimistic-concurrency race.
///
/// `op` must re-read everything it validates on every attempt.
pub async fn retry_on_conflict<T, F, Fut>(max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(LedgerError::Conflict(reason)) if retries < max_retries => {
                retries += 1;
                debug!(%reason, retries, "write conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
