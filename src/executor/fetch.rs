use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clients::SourceClient;
use crate::failure::{RetryPolicy, StageError};
use crate::model::Item;

/// Items read from one feed during one tick. `error` is set when the feed
/// stopped early; the items read before it are still valid.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub items: Vec<Item>,
    pub error: Option<StageError>,
}

/// Reading a feed has no side effects, so fetch needs no ledger entry.
/// Transient failures restart the stream after the last item received.
pub struct FetchExecutor {
    source: Arc<dyn SourceClient>,
    timeout: Duration,
}

impl FetchExecutor {
    pub fn new(source: Arc<dyn SourceClient>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Backoff sleeps end early once `shutdown` flips to `true`; the feed is
    /// then given up for this tick.
    pub async fn execute(
        &self,
        feed: &str,
        since: Option<&str>,
        policy: &RetryPolicy,
        shutdown: &watch::Receiver<bool>,
    ) -> FetchOutcome {
        let mut items = Vec::new();
        let mut cursor = since.map(str::to_string);
        let mut attempt = 1;
        loop {
            match self.drain(feed, cursor.as_deref(), &mut items).await {
                Ok(()) => {
                    debug!(feed, count = items.len(), "feed drained");
                    return FetchOutcome { items, error: None };
                }
                Err(err) => {
                    if let Some(last) = items.last() {
                        cursor = Some(last.id.clone());
                    }
                    if !err.is_transient() || policy.is_last(attempt) {
                        warn!(feed, attempt, error = %err, "giving up on feed for this tick");
                        return FetchOutcome {
                            items,
                            error: Some(err),
                        };
                    }
                    warn!(feed, attempt, error = %err, "feed read failed; retrying");
                    if !backoff(policy.delay_after(attempt), shutdown).await {
                        warn!(feed, attempt, "feed retry abandoned on shutdown");
                        return FetchOutcome {
                            items,
                            error: Some(err),
                        };
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn drain(
        &self,
        feed: &str,
        since: Option<&str>,
        out: &mut Vec<Item>,
    ) -> Result<(), StageError> {
        let mut stream = self.source.list_new_items(feed, since);
        loop {
            let next = tokio::time::timeout(self.timeout, stream.next())
                .await
                .map_err(|_| StageError::transient("timeout"))?;
            match next {
                None => return Ok(()),
                Some(Ok(item)) => out.push(item),
                Some(Err(err)) => return Err(err),
            }
        }
    }
}

/// Sleeps for `delay`; `false` if shutdown was requested first.
async fn backoff(delay: Duration, shutdown: &watch::Receiver<bool>) -> bool {
    let mut rx = shutdown.clone();
    if *rx.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = rx.changed() => false,
    }
}
