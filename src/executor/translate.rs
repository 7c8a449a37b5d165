use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{settle, with_timeout};
use crate::clients::TranslationClient;
use crate::db::ledger::{self, Claim};
use crate::db::Pool;
use crate::failure::{RetryPolicy, StageResult};
use crate::model::{IdempotencyKey, Item, StageKey};

/// Translation runs once per item regardless of how many destinations
/// are enabled; the ledger key is `(item_id, "translate")`.
pub struct TranslateExecutor {
    pool: Pool,
    client: Arc<dyn TranslationClient>,
    timeout: Duration,
}

impl TranslateExecutor {
    pub fn new(pool: Pool, client: Arc<dyn TranslationClient>, timeout: Duration) -> Self {
        Self {
            pool,
            client,
            timeout,
        }
    }

    pub async fn execute(
        &self,
        item: &Item,
        attempt: u32,
        policy: &RetryPolicy,
    ) -> Result<StageResult> {
        if item.content.trim().is_empty() {
            return Ok(StageResult::Skipped("no text to translate".into()));
        }
        let key = IdempotencyKey::new(&item.id, StageKey::Translate);
        match ledger::claim(&self.pool, &key).await? {
            Claim::Succeeded(text) => {
                debug!(key = %key, "translation already recorded");
                return Ok(StageResult::Succeeded(text));
            }
            Claim::Failed(reason) => return Ok(StageResult::Failed(reason)),
            Claim::Interrupted { .. } => {
                // No lookup exists for completed translations; the model may bill twice.
                warn!(key = %key, "previous translation was interrupted; re-dispatching (at-least-once)");
            }
            Claim::Proceed { .. } => {}
        }
        let outcome = with_timeout(self.timeout, self.client.translate(&item.content)).await;
        settle(&self.pool, &key, attempt, policy, outcome).await
    }
}
