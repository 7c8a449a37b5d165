//! Pipeline coordinator: the single writer of record state.
//!
//! The coordinator owns every stage transition. Executors run as tasks,
//! bounded by a shared worker pool, and report back through the `on_*`
//! handlers. Each handler is a compare-and-swap transaction taken under the
//! item's lock, so duplicate, late or out-of-order signals are discarded
//! instead of regressing a record.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clients::{PublishClient, SourceClient, TranslationClient};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::executor::{FetchExecutor, PublishExecutor, TranslateExecutor};
use crate::failure::{RetryPolicy, StageResult};
use crate::model::{
    Destination, DestinationStatus, Item, PublishResult, Stage, StageKey, SyncRecord,
};

pub mod locks;

use locks::ItemLocks;

/// Reason recorded for destinations settled after being disabled.
pub const DESTINATION_DISABLED: &str = "destination disabled";

/// What an event handler did with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The record already moved past the stage the signal refers to.
    Stale,
    /// The signal refers to an unknown item.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Source feeds polled on every tick.
    pub feeds: Vec<String>,
    pub destinations: Vec<Destination>,
    pub fetch_policy: RetryPolicy,
    pub translate_policy: RetryPolicy,
    pub publish_policy: RetryPolicy,
    pub concurrency: usize,
    pub stage_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            feeds: cfg
                .source
                .user_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            destinations: cfg.destinations.enabled.clone(),
            fetch_policy: cfg.retry_policy(&cfg.retry.fetch),
            translate_policy: cfg.retry_policy(&cfg.retry.translate),
            publish_policy: cfg.retry_policy(&cfg.retry.publish),
            concurrency: cfg.app.concurrency,
            stage_timeout: cfg.stage_timeout(),
        }
    }
}

/// External clients, injected at construction.
pub struct Collaborators {
    pub source: Arc<dyn SourceClient>,
    pub translator: Arc<dyn TranslationClient>,
    pub publishers: Vec<Arc<dyn PublishClient>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    /// Items returned by the source, including redeliveries.
    pub observed: usize,
    /// Records created by this run.
    pub created: usize,
    /// `(feed, error)` for feeds that stopped early.
    pub feed_errors: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Pool,
    settings: PipelineSettings,
    fetch: FetchExecutor,
    translate: TranslateExecutor,
    publish: BTreeMap<Destination, PublishExecutor>,
    locks: ItemLocks,
    fetch_gate: AsyncMutex<()>,
    workers: Semaphore,
    tasks: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(pool: Pool, settings: PipelineSettings, clients: Collaborators) -> Result<Self> {
        let timeout = settings.stage_timeout;
        let mut publish = BTreeMap::new();
        for client in clients.publishers {
            let destination = client.destination();
            if !settings.destinations.contains(&destination) {
                debug!(%destination, "publish client for disabled destination ignored");
                continue;
            }
            if publish
                .insert(destination, PublishExecutor::new(pool.clone(), client, timeout))
                .is_some()
            {
                return Err(anyhow!("more than one publish client for {}", destination));
            }
        }
        if let Some(missing) = settings
            .destinations
            .iter()
            .find(|d| !publish.contains_key(*d))
        {
            return Err(anyhow!("no publish client for enabled destination {}", missing));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                fetch: FetchExecutor::new(clients.source, timeout),
                translate: TranslateExecutor::new(pool.clone(), clients.translator, timeout),
                publish,
                locks: ItemLocks::default(),
                fetch_gate: AsyncMutex::new(()),
                workers: Semaphore::new(settings.concurrency.max(1)),
                tasks: Mutex::new(JoinSet::new()),
                shutdown_tx,
                shutdown_rx,
                settings,
                pool,
            }),
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Polls every feed once, records new items and starts their pipelines.
    /// Concurrent calls are serialized; an item already recorded is never
    /// scheduled again from here.
    pub async fn trigger_fetch(&self) -> Result<FetchReport> {
        let _gate = self.inner.fetch_gate.lock().await;
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            reap_finished(&mut tasks);
        }
        let pool = &self.inner.pool;
        let mut report = FetchReport::default();

        for feed in &self.inner.settings.feeds {
            if self.is_shutting_down() {
                break;
            }
            let since = db::get_cursor(pool, feed).await?;
            let outcome = self
                .inner
                .fetch
                .execute(
                    feed,
                    since.as_deref(),
                    &self.inner.settings.fetch_policy,
                    &self.inner.shutdown_rx,
                )
                .await;
            report.observed += outcome.items.len();

            for item in &outcome.items {
                if db::record_item(pool, item).await? {
                    report.created += 1;
                    info!(item_id = %item.id, feed = %feed, "new item recorded");
                    self.on_fetched(&item.id).await?;
                } else {
                    debug!(item_id = %item.id, "item already recorded");
                }
                db::set_cursor(pool, feed, &item.id).await?;
            }
            if let Some(err) = outcome.error {
                report.feed_errors.push((feed.clone(), err.to_string()));
            }
        }

        info!(
            observed = report.observed,
            created = report.created,
            failed_feeds = report.feed_errors.len(),
            "fetch tick complete"
        );
        Ok(report)
    }

    /// NEW -> FETCHED, then schedules translation. Items that fail validation
    /// go straight to FAILED.
    pub async fn on_fetched(&self, item_id: &str) -> Result<Outcome> {
        let guard = self.inner.locks.lock(item_id).await;
        let mut tx = self.inner.pool.begin().await?;
        let Some(record) = db::load_record(&mut tx, item_id).await? else {
            warn!(item_id, "fetched signal for unknown item discarded");
            return Ok(Outcome::Rejected);
        };
        if record.stage != Stage::New {
            debug!(item_id, stage = %record.stage, "stale fetched signal");
            return Ok(Outcome::Stale);
        }
        let item = db::fetch_item(&mut tx, item_id)
            .await?
            .ok_or_else(|| anyhow!("record {} has no item", item_id))?;
        if let Err(reason) = item.validate() {
            db::fail_record(&mut tx, item_id, Stage::New, &reason).await?;
            tx.commit().await?;
            warn!(item_id, reason = %reason, "item rejected");
            return Ok(Outcome::Applied);
        }
        if !db::advance_stage(&mut tx, item_id, Stage::New, Stage::Fetched).await? {
            return Ok(Outcome::Stale);
        }
        tx.commit().await?;
        drop(guard);

        self.schedule_translate(item_id);
        Ok(Outcome::Applied)
    }

    /// TRANSLATING -> TRANSLATED with the text, then one publish task per
    /// enabled destination. Replays are stale and schedule nothing.
    pub async fn on_translated(&self, item_id: &str, text: &str) -> Result<Outcome> {
        let guard = self.inner.locks.lock(item_id).await;
        let mut tx = self.inner.pool.begin().await?;
        let Some(record) = db::load_record(&mut tx, item_id).await? else {
            warn!(item_id, "translated signal for unknown item discarded");
            return Ok(Outcome::Rejected);
        };
        if record.stage != Stage::Translating {
            debug!(item_id, stage = %record.stage, "stale translated signal");
            return Ok(Outcome::Stale);
        }
        if !db::complete_translation(&mut tx, item_id, text).await? {
            return Ok(Outcome::Stale);
        }
        let destinations = &self.inner.settings.destinations;
        db::init_destinations(&mut tx, item_id, destinations).await?;
        tx.commit().await?;
        drop(guard);

        info!(item_id, chars = text.chars().count(), "translation stored");
        for destination in destinations {
            self.schedule_publish(item_id, *destination);
        }
        Ok(Outcome::Applied)
    }

    /// Settles one destination. The record becomes DONE once every
    /// destination is PUBLISHED, SKIPPED or FAILED.
    pub async fn on_publish_result(
        &self,
        item_id: &str,
        destination: Destination,
        result: PublishResult,
    ) -> Result<Outcome> {
        let _guard = self.inner.locks.lock(item_id).await;
        let mut tx = self.inner.pool.begin().await?;
        let Some(record) = db::load_record(&mut tx, item_id).await? else {
            warn!(item_id, %destination, "publish result for unknown item discarded");
            return Ok(Outcome::Rejected);
        };
        if !matches!(record.stage, Stage::Translated | Stage::Publishing) {
            debug!(item_id, %destination, stage = %record.stage, "stale publish result");
            return Ok(Outcome::Stale);
        }
        let next = DestinationStatus::from(result);
        let applied = db::transition_destination(
            &mut tx,
            item_id,
            destination,
            &[
                DestinationStatus::Pending.label(),
                DestinationStatus::Publishing.label(),
            ],
            &next,
        )
        .await?;
        if !applied {
            debug!(item_id, %destination, "destination already settled; result discarded");
            return Ok(Outcome::Stale);
        }

        let updated = db::load_record(&mut tx, item_id)
            .await?
            .ok_or_else(|| anyhow!("record {} vanished mid-transaction", item_id))?;
        let done = updated.all_destinations_settled();
        if done {
            if updated.stage == Stage::Translated {
                db::advance_stage(&mut tx, item_id, Stage::Translated, Stage::Publishing).await?;
            }
            db::advance_stage(&mut tx, item_id, Stage::Publishing, Stage::Done).await?;
        }
        tx.commit().await?;

        match &next {
            DestinationStatus::Failed(reason) => {
                warn!(item_id, %destination, reason = %reason, "destination failed")
            }
            status => info!(item_id, %destination, status = status.label(), "destination settled"),
        }
        if done {
            info!(item_id, "all destinations settled");
        }
        Ok(Outcome::Applied)
    }

    /// Fails the record when a shared stage cannot complete.
    pub async fn on_stage_failed(
        &self,
        item_id: &str,
        stage: Stage,
        reason: &str,
    ) -> Result<Outcome> {
        let _guard = self.inner.locks.lock(item_id).await;
        let mut tx = self.inner.pool.begin().await?;
        let Some(record) = db::load_record(&mut tx, item_id).await? else {
            warn!(item_id, "failure signal for unknown item discarded");
            return Ok(Outcome::Rejected);
        };
        if record.stage != stage || stage.is_terminal() {
            debug!(item_id, stage = %record.stage, "stale failure signal");
            return Ok(Outcome::Stale);
        }
        if !db::fail_record(&mut tx, item_id, stage, reason).await? {
            return Ok(Outcome::Stale);
        }
        tx.commit().await?;
        warn!(item_id, %stage, reason = %reason, "record failed");
        Ok(Outcome::Applied)
    }

    /// Reschedules work for records left open by a previous run. Safe to
    /// replay: completed side effects are answered from the ledger.
    pub async fn resume(&self) -> Result<usize> {
        let ids = db::open_item_ids(&self.inner.pool).await?;
        for id in &ids {
            let Some(record) = db::get_record(&self.inner.pool, id).await? else {
                continue;
            };
            match record.stage {
                Stage::New => {
                    self.on_fetched(id).await?;
                }
                Stage::Fetched | Stage::Translating => self.schedule_translate(id),
                Stage::Translated | Stage::Publishing => {
                    for (destination, status) in &record.destination_statuses {
                        if status.is_open() {
                            self.schedule_publish(id, *destination);
                        }
                    }
                }
                Stage::Done | Stage::Failed => {}
            }
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "resumed open records");
        }
        Ok(ids.len())
    }

    pub async fn status(&self, item_id: &str) -> Result<Option<SyncRecord>> {
        db::get_record(&self.inner.pool, item_id).await
    }

    /// Records that are FAILED or have a FAILED destination.
    pub async fn attention(&self) -> Result<Vec<SyncRecord>> {
        db::records_needing_attention(&self.inner.pool).await
    }

    /// Waits until no pipeline task is running, including tasks spawned
    /// while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let mut running = {
                let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *tasks)
            };
            if running.is_empty() {
                return;
            }
            while let Some(res) = running.join_next().await {
                if let Err(err) = res {
                    error!(?err, "pipeline task aborted");
                }
            }
        }
    }

    /// Stops scheduling new work and pending retries. Calls already
    /// dispatched run to completion.
    pub fn shutdown(&self) {
        if self.inner.shutdown_tx.send(true).is_ok() {
            info!("coordinator shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_rx.borrow()
    }

    /// Resolves once `shutdown` has been called.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown_rx.clone();
        // Only errs once the sender in `inner` is dropped.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Pipeline tasks still held by the coordinator, finished ones included
    /// until the next spawn or tick reaps them.
    pub fn tracked_tasks(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            debug!("shutting down; task not scheduled");
            return;
        }
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        reap_finished(&mut tasks);
        tasks.spawn(task);
    }

    /// Sleeps for a backoff delay; `false` if shutdown interrupted it.
    async fn pause(&self, delay: Duration) -> bool {
        let mut rx = self.inner.shutdown_rx.clone();
        if *rx.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = rx.changed() => false,
        }
    }

    async fn record_attempt(&self, item_id: &str, stage: StageKey) -> Result<u32> {
        let attempts = db::bump_attempt(&self.inner.pool, item_id, &stage.to_string()).await?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    fn schedule_translate(&self, item_id: &str) {
        let this = self.clone();
        let item_id = item_id.to_string();
        self.spawn(async move {
            if let Err(err) = this.run_translate(&item_id).await {
                error!(item_id = %item_id, ?err, "translate task failed");
            }
        });
    }

    fn schedule_publish(&self, item_id: &str, destination: Destination) {
        let this = self.clone();
        let item_id = item_id.to_string();
        self.spawn(async move {
            if let Err(err) = this.run_publish(&item_id, destination).await {
                error!(item_id = %item_id, %destination, ?err, "publish task failed");
            }
        });
    }

    /// FETCHED -> TRANSLATING. A record already TRANSLATING is resumed.
    async fn begin_translate(&self, item_id: &str) -> Result<Option<Item>> {
        let _guard = self.inner.locks.lock(item_id).await;
        let mut tx = self.inner.pool.begin().await?;
        let Some(record) = db::load_record(&mut tx, item_id).await? else {
            return Ok(None);
        };
        match record.stage {
            Stage::Fetched => {
                if !db::advance_stage(&mut tx, item_id, Stage::Fetched, Stage::Translating).await? {
                    return Ok(None);
                }
            }
            Stage::Translating => debug!(item_id, "resuming translation"),
            other => {
                debug!(item_id, stage = %other, "translation no longer needed");
                return Ok(None);
            }
        }
        let item = db::fetch_item(&mut tx, item_id)
            .await?
            .ok_or_else(|| anyhow!("record {} has no item", item_id))?;
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn run_translate(&self, item_id: &str) -> Result<()> {
        let Some(item) = self.begin_translate(item_id).await? else {
            return Ok(());
        };
        let policy = self.inner.settings.translate_policy;
        loop {
            let attempt = self.record_attempt(item_id, StageKey::Translate).await?;
            let result = {
                let _permit = self
                    .inner
                    .workers
                    .acquire()
                    .await
                    .context("worker pool closed")?;
                self.inner.translate.execute(&item, attempt, &policy).await?
            };
            match result {
                StageResult::Succeeded(text) => {
                    self.on_translated(item_id, &text).await?;
                    return Ok(());
                }
                StageResult::Skipped(reason) => {
                    info!(item_id, reason = %reason, "translation skipped");
                    self.on_translated(item_id, "").await?;
                    return Ok(());
                }
                StageResult::Failed(reason) => {
                    self.on_stage_failed(item_id, Stage::Translating, &reason).await?;
                    return Ok(());
                }
                StageResult::Retry(reason) => {
                    let delay = policy.delay_after(attempt);
                    debug!(item_id, attempt, reason = %reason, ?delay, "translation retry scheduled");
                    if !self.pause(delay).await {
                        info!(item_id, "translation retry abandoned on shutdown");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Marks the destination PUBLISHING (and the record, on the first
    /// destination to start). Returns the item and its translation.
    async fn begin_publish(
        &self,
        item_id: &str,
        destination: Destination,
    ) -> Result<Option<(Item, String)>> {
        let _guard = self.inner.locks.lock(item_id).await;
        let mut tx = self.inner.pool.begin().await?;
        let Some(record) = db::load_record(&mut tx, item_id).await? else {
            return Ok(None);
        };
        match record.stage {
            Stage::Translated => {
                if !db::advance_stage(&mut tx, item_id, Stage::Translated, Stage::Publishing).await? {
                    return Ok(None);
                }
            }
            Stage::Publishing => {}
            other => {
                debug!(item_id, %destination, stage = %other, "publish no longer needed");
                return Ok(None);
            }
        }
        match record.destination_statuses.get(&destination) {
            Some(DestinationStatus::Pending) => {
                let started = db::transition_destination(
                    &mut tx,
                    item_id,
                    destination,
                    &[DestinationStatus::Pending.label()],
                    &DestinationStatus::Publishing,
                )
                .await?;
                if !started {
                    return Ok(None);
                }
            }
            Some(DestinationStatus::Publishing) => {
                debug!(item_id, %destination, "resuming publish")
            }
            _ => {
                debug!(item_id, %destination, "destination already settled");
                return Ok(None);
            }
        }
        let item = db::fetch_item(&mut tx, item_id)
            .await?
            .ok_or_else(|| anyhow!("record {} has no item", item_id))?;
        tx.commit().await?;
        Ok(Some((item, record.translated_text.unwrap_or_default())))
    }

    async fn run_publish(&self, item_id: &str, destination: Destination) -> Result<()> {
        let Some(executor) = self.inner.publish.get(&destination) else {
            // Left open by a run where the destination was still enabled.
            warn!(item_id, %destination, "destination no longer enabled; skipping");
            self.on_publish_result(
                item_id,
                destination,
                PublishResult::Skipped(DESTINATION_DISABLED.into()),
            )
            .await?;
            return Ok(());
        };
        let Some((item, text)) = self.begin_publish(item_id, destination).await? else {
            return Ok(());
        };
        let policy = self.inner.settings.publish_policy;
        loop {
            let attempt = self
                .record_attempt(item_id, StageKey::Publish(destination))
                .await?;
            let result = {
                let _permit = self
                    .inner
                    .workers
                    .acquire()
                    .await
                    .context("worker pool closed")?;
                executor.execute(&item, &text, attempt, &policy).await?
            };
            let settled = match result {
                StageResult::Succeeded(external_ref) => PublishResult::Published(external_ref),
                StageResult::Skipped(reason) => PublishResult::Skipped(reason),
                StageResult::Failed(reason) => PublishResult::Failed(reason),
                StageResult::Retry(reason) => {
                    let delay = policy.delay_after(attempt);
                    debug!(item_id, %destination, attempt, reason = %reason, ?delay, "publish retry scheduled");
                    if !self.pause(delay).await {
                        info!(item_id, %destination, "publish retry abandoned on shutdown");
                        return Ok(());
                    }
                    continue;
                }
            };
            self.on_publish_result(item_id, destination, settled).await?;
            return Ok(());
        }
    }
}

/// Joins tasks that already completed so the set only holds live work.
fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.try_join_next() {
        if let Err(err) = res {
            error!(?err, "pipeline task aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        let settings = PipelineSettings::from_config(&cfg);
        assert_eq!(settings.feeds, vec!["44196397".to_string()]);
        assert_eq!(
            settings.destinations,
            vec![Destination::Xhs, Destination::Wechat]
        );
        assert_eq!(settings.publish_policy.max_attempts, 3);
        assert_eq!(settings.stage_timeout, Duration::from_secs(120));
    }
}
