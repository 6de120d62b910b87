// Bounded retry with backoff for transient Postgres errors (serialization
// failures, `40001`; deadlocks, `40P01`). Same shape as the teacher's
// callback-delivery retry (fixed delay schedule, bounded attempts), applied
// here to store transactions instead of webhook HTTP calls.

use std::future::Future;
use std::time::Duration;

use sqlx::Error as SqlxError;

use crate::core::error::{BundlerError, BundlerResult};

const RETRY_DELAYS_MS: [u64; 4] = [10, 50, 200, 500];

fn is_retryable(error: &BundlerError) -> bool {
    match error {
        BundlerError::Database(SqlxError::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("40001" | "40P01"))
        }
        BundlerError::Database(SqlxError::PoolTimedOut | SqlxError::Io(_)) => true,
        _ => false,
    }
}

/// Run `op` up to `RETRY_DELAYS_MS.len() + 1` times, retrying only on
/// serialization failures and deadlocks. Any other error, or a transient
/// error on the final attempt, is returned as-is.
pub async fn with_serializable_retry<F, Fut, T>(mut op: F) -> BundlerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BundlerResult<T>>,
{
    for delay_ms in RETRY_DELAYS_MS.iter().copied() {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
    op().await
}
