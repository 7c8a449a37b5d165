use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{settle, with_timeout};
use crate::clients::{PublishClient, PublishRequest};
use crate::db::ledger::{self, Claim};
use crate::db::Pool;
use crate::failure::{RetryPolicy, StageResult};
use crate::model::{Destination, IdempotencyKey, Item, StageKey};

/// One executor per destination. Its ledger key is tagged with the
/// destination, so each destination publishes at most once per item.
pub struct PublishExecutor {
    pool: Pool,
    client: Arc<dyn PublishClient>,
    timeout: Duration,
}

impl PublishExecutor {
    pub fn new(pool: Pool, client: Arc<dyn PublishClient>, timeout: Duration) -> Self {
        Self {
            pool,
            client,
            timeout,
        }
    }

    pub fn destination(&self) -> Destination {
        self.client.destination()
    }

    pub async fn execute(
        &self,
        item: &Item,
        translated_text: &str,
        attempt: u32,
        policy: &RetryPolicy,
    ) -> Result<StageResult> {
        if translated_text.trim().is_empty() {
            return Ok(StageResult::Skipped("empty translation".into()));
        }
        if let Some(reason) = self.client.skip_reason(item) {
            return Ok(StageResult::Skipped(reason));
        }

        let destination = self.destination();
        let key = IdempotencyKey::new(&item.id, StageKey::Publish(destination));
        let request = PublishRequest {
            item,
            translated_text,
            idempotency_key: &key,
        };

        match ledger::claim(&self.pool, &key).await? {
            Claim::Succeeded(external_ref) => {
                debug!(key = %key, external_ref = %external_ref, "already published");
                return Ok(StageResult::Succeeded(external_ref));
            }
            Claim::Failed(reason) => return Ok(StageResult::Failed(reason)),
            Claim::Interrupted { .. } if self.client.supports_reconciliation() => {
                let found = with_timeout(self.timeout, self.client.find_existing(&request)).await;
                match found {
                    Ok(Some(external_ref)) => {
                        info!(key = %key, external_ref = %external_ref, "reconciled interrupted publish");
                        return settle(&self.pool, &key, attempt, policy, Ok(external_ref)).await;
                    }
                    Ok(None) => {
                        info!(key = %key, "interrupted publish left nothing behind; publishing");
                    }
                    Err(err) if err.is_transient() && !policy.is_last(attempt) => {
                        // Entry stays in flight so the next attempt looks up again
                        // instead of publishing blind.
                        warn!(key = %key, reason = %err.reason(), "reconciliation lookup failed");
                        return Ok(StageResult::Retry(err.reason().to_string()));
                    }
                    Err(err) => {
                        return settle(&self.pool, &key, attempt, policy, Err(err)).await;
                    }
                }
            }
            Claim::Interrupted { .. } => {
                warn!(
                    key = %key,
                    destination = %destination,
                    "previous publish was interrupted and cannot be reconciled; re-publishing (at-least-once)"
                );
            }
            Claim::Proceed { .. } => {}
        }

        let outcome = with_timeout(self.timeout, self.client.publish(&request)).await;
        settle(&self.pool, &key, attempt, policy, outcome).await
    }
}
