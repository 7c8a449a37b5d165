//! Stage executors. Each wraps one collaborator call behind the idempotency
//! ledger and the timeout/retry classification, and reports a `StageResult`
//! back to the coordinator. Executors write only to the ledger; record state
//! is the coordinator's.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::{ledger, Pool};
use crate::failure::{RetryPolicy, StageError, StageResult};
use crate::model::IdempotencyKey;

pub mod fetch;
pub mod publish;
pub mod translate;

pub use fetch::{FetchExecutor, FetchOutcome};
pub use publish::PublishExecutor;
pub use translate::TranslateExecutor;

/// Runs `fut` with a deadline; running out is a transient `timeout`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StageError::transient("timeout")),
    }
}

/// Persists the outcome of a dispatched call and converts it for the
/// coordinator. A transient error on the last allowed attempt becomes a
/// failure carrying the last reason.
pub(crate) async fn settle(
    pool: &Pool,
    key: &IdempotencyKey,
    attempt: u32,
    policy: &RetryPolicy,
    outcome: Result<String, StageError>,
) -> Result<StageResult> {
    match outcome {
        Ok(value) => {
            ledger::record_success(pool, key, &value).await?;
            Ok(StageResult::Succeeded(value))
        }
        Err(StageError::Terminal(reason)) => {
            warn!(key = %key, attempt, reason = %reason, "terminal failure");
            ledger::record_failure(pool, key, &reason).await?;
            Ok(StageResult::Failed(reason))
        }
        Err(StageError::Transient(reason)) if policy.is_last(attempt) => {
            warn!(key = %key, attempt, reason = %reason, "retries exhausted");
            ledger::record_failure(pool, key, &reason).await?;
            Ok(StageResult::Failed(reason))
        }
        Err(StageError::Transient(reason)) => {
            info!(key = %key, attempt, reason = %reason, "transient failure; will retry");
            ledger::record_retryable(pool, key, &reason).await?;
            Ok(StageResult::Retry(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_transient() {
        let res: Result<(), StageError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(res, Err(StageError::transient("timeout")));
    }

    #[tokio::test]
    async fn fast_call_passes_through() {
        let res = with_timeout(Duration::from_secs(1), async {
            Err::<(), _>(StageError::terminal("rejected"))
        })
        .await;
        assert_eq!(res, Err(StageError::terminal("rejected")));
    }
}
