//! Periodic consumer driving the deferred purge path.

use std::{sync::Arc, time::Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::references::PurgeTarget;

use super::{
    PurgeError,
    config::PurgeConfig,
    dispatcher::Dispatcher,
    object_queue::{ObjectQueue, ParseReport},
    resolver::Resolver,
    url_queue::UrlQueue,
};

const METRIC_TICK_MS: &str = "edgepurge_tick_ms";
const METRIC_ITEMS_FLAGGED: &str = "edgepurge_items_flagged_failed_total";

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub tick_id: Uuid,
    pub released_stale: u64,
    pub parse: ParseReport,
    pub purged_all: bool,
    /// URL-queue items retired by a purge-all.
    pub coalesced: u64,
    pub batches: usize,
    pub chunks_sent: usize,
    pub completed: u64,
    pub retried: u64,
    pub flagged_failed: u64,
    /// Message of the dispatch failure that ended the drain early.
    pub dispatch_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub objects_deleted: u64,
    pub urls_deleted: u64,
}

/// Runs the pipeline steps in order:
///
/// 1. Release stale reservations on both queues
/// 2. Resolve waiting references into the URL queue
/// 3. Send a waiting purge-all and retire the targets enqueued before it went out
/// 4. Drain the URL queue in batches, stopping at the first failing batch
/// 5. Flag exhausted items on both queues
///
/// Overlapping ticks are safe; claims happen in storage.
pub struct PurgeConsumer {
    config: PurgeConfig,
    objects: ObjectQueue,
    urls: UrlQueue,
    resolver: Arc<Resolver>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl PurgeConsumer {
    pub fn new(
        config: PurgeConfig,
        objects: ObjectQueue,
        urls: UrlQueue,
        resolver: Arc<Resolver>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Self {
        Self {
            config,
            objects,
            urls,
            resolver,
            dispatcher,
        }
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }

    #[instrument(skip(self), fields(tick_id = tracing::field::Empty))]
    pub async fn tick(&self) -> Result<TickReport, PurgeError> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| PurgeError::NotConfigured("no purge driver configured".to_string()))?;

        let started_at = Instant::now();
        let mut report = TickReport {
            tick_id: Uuid::new_v4(),
            ..TickReport::default()
        };
        tracing::Span::current().record("tick_id", tracing::field::display(report.tick_id));

        let timeout = self.config.reservation_timeout;
        report.released_stale = self
            .objects
            .queue()
            .release_stale_reservations(timeout)
            .await?
            + self.urls.queue().release_stale_reservations(timeout).await?;

        report.parse = self
            .objects
            .parse_queue(
                &self.resolver,
                &self.urls,
                self.config.object_batch_size,
                self.config.max_attempts,
            )
            .await?;

        let purge_all_ok = self.coalesce_purge_all(dispatcher, &mut report).await?;
        if purge_all_ok {
            self.drain(dispatcher, &mut report).await?;
        }

        report.flagged_failed = self.flag_exhausted().await?;

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_TICK_MS).record(elapsed_ms);
        info!(
            released_stale = report.released_stale,
            parsed = report.parse.parsed,
            parse_failed = report.parse.failed,
            purged_all = report.purged_all,
            batches = report.batches,
            completed = report.completed,
            retried = report.retried,
            flagged_failed = report.flagged_failed,
            elapsed_ms,
            "purge tick finished"
        );
        Ok(report)
    }

    /// Returns `false` when a purge-all was attempted and failed.
    async fn coalesce_purge_all(
        &self,
        dispatcher: &Dispatcher,
        report: &mut TickReport,
    ) -> Result<bool, PurgeError> {
        let queue = self.urls.queue();
        let Some(marker) = self.urls.pending_purge_all().await? else {
            return Ok(true);
        };
        // Left for the failure sweep.
        if marker.attempts >= self.config.max_attempts {
            return Ok(true);
        }
        // Another tick got there first.
        let Some(marker) = queue.reserve_item(&marker, false).await? else {
            return Ok(true);
        };
        // Only targets enqueued before the purge-all goes out are covered by it.
        let covered_up_to = queue.last_item_id().await?.unwrap_or(marker.id);

        let dispatch = dispatcher.dispatch(&[PurgeTarget::All]).await;
        report.batches += 1;
        report.chunks_sent += dispatch.chunks_sent;

        let settled = self.urls.settle(std::slice::from_ref(&marker), &dispatch).await?;
        report.completed += settled.completed;
        report.retried += settled.retried;

        if let Some(err) = dispatch.error {
            report.dispatch_error = Some(err.to_string());
            return Ok(false);
        }

        report.purged_all = true;
        report.coalesced = queue.complete_available(covered_up_to).await?;
        report.completed += report.coalesced;
        info!(coalesced = report.coalesced, "purge-all superseded waiting targets");
        Ok(true)
    }

    async fn drain(&self, dispatcher: &Dispatcher, report: &mut TickReport) -> Result<(), PurgeError> {
        let mut drained: u32 = 0;
        loop {
            let round = self.config.next_drain_round(drained);
            if round == 0 {
                break;
            }
            let items = self
                .urls
                .reserve_batch(round, self.config.max_attempts)
                .await?;
            if items.is_empty() {
                break;
            }
            drained = drained.saturating_add(u32::try_from(items.len()).unwrap_or(u32::MAX));

            let targets: Vec<PurgeTarget> = items.iter().map(|item| item.payload.clone()).collect();
            let dispatch = dispatcher.dispatch(&targets).await;
            report.batches += 1;
            report.chunks_sent += dispatch.chunks_sent;
            report.purged_all |= dispatch.purged_all && dispatch.is_success();

            let settled = self.urls.settle(&items, &dispatch).await?;
            report.completed += settled.completed;
            report.retried += settled.retried;

            if let Some(err) = dispatch.error {
                warn!(error = %err, retried = settled.retried, "drain stopped after failed batch");
                report.dispatch_error = Some(err.to_string());
                break;
            }
        }
        Ok(())
    }

    async fn flag_exhausted(&self) -> Result<u64, PurgeError> {
        let (threshold, batch) = (self.config.max_attempts, self.config.flag_batch_size);
        let flagged = self
            .objects
            .queue()
            .flag_max_attempted_items_as_failed(threshold, batch)
            .await?
            + self
                .urls
                .queue()
                .flag_max_attempted_items_as_failed(threshold, batch)
                .await?;
        if flagged > 0 {
            counter!(METRIC_ITEMS_FLAGGED).increment(flagged);
            warn!(flagged, threshold, "items exceeded the attempt threshold");
        }
        Ok(flagged)
    }

    /// Delete items older than the retention window from both queues,
    /// whatever their state.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<CleanupReport, PurgeError> {
        let cutoff = OffsetDateTime::now_utc() - self.config.retention;
        let report = CleanupReport {
            objects_deleted: self.objects.queue().delete_older_than(cutoff).await?,
            urls_deleted: self.urls.queue().delete_older_than(cutoff).await?,
        };
        info!(
            objects_deleted = report.objects_deleted,
            urls_deleted = report.urls_deleted,
            "purge queue cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use time::macros::datetime;
    use url::Url;

    use super::*;
    use crate::{
        application::repos::{ContentWriteRepo, QueueRepo, UpsertPostParams},
        domain::{references::ContentReference, types::PostStatus},
        infra::db::SqliteRepositories,
        purge::{
            driver::{
                DriverDescriptor, DriverError, PurgeDriver,
                testing::{Call, RecordingDriver},
            },
            resolver::ResolverConfig,
        },
        queue::Queue,
    };

    struct Fixture {
        consumer: PurgeConsumer,
        objects: ObjectQueue,
        urls: UrlQueue,
        driver: Arc<RecordingDriver>,
    }

    async fn fixture(config: PurgeConfig, max_batch: usize) -> Fixture {
        let repos = Arc::new(SqliteRepositories::in_memory().await.unwrap());
        repos
            .upsert_post(&UpsertPostParams {
                id: 1,
                slug: "hello".to_string(),
                post_type: "post".to_string(),
                status: PostStatus::Publish,
                author_id: None,
                published_at: Some(datetime!(2024-05-01 09:00 UTC)),
                term_ids: Vec::new(),
            })
            .await
            .unwrap();

        let queue_repo: Arc<dyn QueueRepo> = repos.clone();
        let objects = ObjectQueue::new(Queue::new("t_purge_objects", queue_repo.clone()));
        let urls = UrlQueue::new(Queue::new("t_purge_urls", queue_repo));
        let resolver = Arc::new(Resolver::new(
            ResolverConfig::new(Url::parse("https://site.test/").unwrap()),
            repos,
        ));
        let driver = Arc::new(RecordingDriver::new(max_batch));
        let dispatcher = Arc::new(Dispatcher::new(driver.clone(), config.batch_size_cap));

        Fixture {
            consumer: PurgeConsumer::new(
                config,
                objects.clone(),
                urls.clone(),
                resolver,
                Some(dispatcher),
            ),
            objects,
            urls,
            driver,
        }
    }

    #[tokio::test]
    async fn tick_resolves_and_dispatches_a_post() {
        let fx = fixture(PurgeConfig::default(), 30).await;
        fx.objects.add(&ContentReference::Post(1)).await.unwrap();

        let report = fx.consumer.tick().await.unwrap();

        assert_eq!(report.parse.parsed, 1);
        assert_eq!(report.batches, 1);
        assert!(report.dispatch_error.is_none());
        let calls = fx.driver.calls();
        assert_eq!(calls.len(), 1);
        let Call::Urls(sent) = &calls[0] else {
            panic!("expected a URL batch, got {calls:?}");
        };
        assert!(sent.contains(&"https://site.test/2024/05/01/hello/".to_string()));
        assert_eq!(fx.urls.queue().count_available_items().await.unwrap(), 0);
        assert_eq!(
            fx.urls.queue().count_completed_items().await.unwrap(),
            report.completed
        );
    }

    #[tokio::test]
    async fn purge_all_coalesces_waiting_targets() {
        let fx = fixture(PurgeConfig::default(), 30).await;
        for n in 0..10 {
            fx.urls
                .add(&PurgeTarget::Url(format!("https://site.test/{n}/")), None)
                .await
                .unwrap();
        }
        fx.objects.add(&ContentReference::All).await.unwrap();

        let report = fx.consumer.tick().await.unwrap();

        assert_eq!(fx.driver.calls(), vec![Call::All]);
        assert!(report.purged_all);
        assert_eq!(report.coalesced, 10);
        assert_eq!(fx.urls.queue().count_available_items().await.unwrap(), 0);
    }

    /// Enqueues a fresh target while its purge-all is in flight, as an
    /// overlapping tick would.
    struct EnqueueDuringPurgeAll {
        descriptor: DriverDescriptor,
        urls: UrlQueue,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PurgeDriver for EnqueueDuringPurgeAll {
        fn descriptor(&self) -> &DriverDescriptor {
            &self.descriptor
        }

        async fn purge_by_urls(&self, urls: &[String]) -> Result<(), DriverError> {
            self.sent.lock().unwrap().extend_from_slice(urls);
            Ok(())
        }

        async fn purge_by_tags(&self, _tags: &[String]) -> Result<(), DriverError> {
            Ok(())
        }

        async fn purge_all(&self) -> Result<(), DriverError> {
            self.urls
                .add(&PurgeTarget::Url("https://site.test/changed-later/".to_string()), None)
                .await
                .map_err(|err| DriverError::Transport(err.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn purge_all_leaves_targets_enqueued_while_in_flight() {
        let fx = fixture(PurgeConfig::default(), 30).await;
        fx.urls
            .add(&PurgeTarget::Url("https://site.test/before/".to_string()), None)
            .await
            .unwrap();
        fx.urls.add(&PurgeTarget::All, None).await.unwrap();

        let driver = Arc::new(EnqueueDuringPurgeAll {
            descriptor: DriverDescriptor {
                name: "enqueue-during-purge-all",
                max_urls_per_batch: 30,
                purge_all_prefixes: Vec::new(),
            },
            urls: fx.urls.clone(),
            sent: Mutex::new(Vec::new()),
        });
        let consumer = PurgeConsumer::new(
            PurgeConfig::default(),
            fx.objects.clone(),
            fx.urls.clone(),
            fx.consumer.resolver.clone(),
            Some(Arc::new(Dispatcher::new(driver.clone(), None))),
        );

        let report = consumer.tick().await.unwrap();

        assert!(report.purged_all);
        assert_eq!(report.coalesced, 1);
        assert_eq!(
            *driver.sent.lock().unwrap(),
            ["https://site.test/changed-later/".to_string()]
        );
        assert_eq!(fx.urls.queue().count_available_items().await.unwrap(), 0);
        assert_eq!(fx.urls.queue().count_completed_items().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_batch_stops_drain_and_schedules_retry() {
        let config = PurgeConfig {
            url_batch_size: 5,
            ..PurgeConfig::default()
        };
        let fx = fixture(config, 5).await;
        for n in 0..12 {
            fx.urls
                .add(&PurgeTarget::Url(format!("https://site.test/{n}/")), None)
                .await
                .unwrap();
        }
        fx.driver.fail_on(Some(1));

        let report = fx.consumer.tick().await.unwrap();

        assert_eq!(report.batches, 2);
        assert_eq!(report.completed, 5);
        assert_eq!(report.retried, 5);
        assert!(report.dispatch_error.is_some());
        // Two items were never reserved, five are back with one attempt.
        assert_eq!(fx.urls.queue().count_available_items().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn drain_limit_throttles_each_tick() {
        let config = PurgeConfig {
            drain_limit: Some(1),
            ..PurgeConfig::default()
        };
        let fx = fixture(config, 30).await;
        for n in 0..3 {
            fx.urls
                .add(&PurgeTarget::Url(format!("https://site.test/{n}/")), None)
                .await
                .unwrap();
        }

        fx.consumer.tick().await.unwrap();
        assert_eq!(fx.driver.calls().len(), 1);
        assert_eq!(fx.urls.queue().count_available_items().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn repeated_failures_end_in_failed_state() {
        let fx = fixture(PurgeConfig::default(), 30).await;
        fx.urls
            .add(&PurgeTarget::Url("https://site.test/x/".to_string()), None)
            .await
            .unwrap();

        for _ in 0..3 {
            fx.driver.fail_on(Some(fx.driver.calls().len()));
            fx.consumer.tick().await.unwrap();
        }

        assert_eq!(fx.urls.queue().count_failed_items().await.unwrap(), 1);
        fx.driver.fail_on(None);
        let report = fx.consumer.tick().await.unwrap();
        assert_eq!(report.batches, 0);
    }

    #[tokio::test]
    async fn exhausted_targets_wait_for_the_failure_sweep() {
        let config = PurgeConfig {
            flag_batch_size: 2,
            ..PurgeConfig::default()
        };
        let max_attempts = config.max_attempts;
        let fx = fixture(config, 30).await;
        for n in 0..5 {
            fx.urls
                .add(&PurgeTarget::Url(format!("https://site.test/{n}/")), None)
                .await
                .unwrap();
        }

        let mut flagged = 0;
        for _ in 0..5 {
            fx.driver.fail_on(Some(fx.driver.calls().len()));
            flagged += fx.consumer.tick().await.unwrap().flagged_failed;
        }

        // One failing batch per tick until every item ran out of attempts.
        assert_eq!(fx.driver.calls().len(), usize::try_from(max_attempts).unwrap());
        assert_eq!(flagged, 5);
        assert_eq!(fx.urls.queue().count_failed_items().await.unwrap(), 5);
        let items = fx.urls.queue().get_items(&Default::default()).await.unwrap();
        assert!(items.iter().all(|item| item.attempts == max_attempts));
    }

    #[tokio::test]
    async fn tick_without_driver_touches_nothing() {
        let fx = fixture(PurgeConfig::default(), 30).await;
        fx.objects.add(&ContentReference::Post(1)).await.unwrap();
        let consumer = PurgeConsumer::new(
            PurgeConfig::default(),
            fx.objects.clone(),
            fx.urls.clone(),
            fx.consumer.resolver.clone(),
            None,
        );

        let err = consumer.tick().await.unwrap_err();
        assert!(matches!(err, PurgeError::NotConfigured(_)));
        assert_eq!(fx.objects.queue().count_available_items().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cleanup_removes_items_past_retention() {
        let config = PurgeConfig {
            retention: time::Duration::seconds(-60),
            ..PurgeConfig::default()
        };
        let fx = fixture(config, 30).await;
        fx.objects.add(&ContentReference::Post(1)).await.unwrap();
        fx.urls
            .add(&PurgeTarget::Url("https://site.test/".to_string()), None)
            .await
            .unwrap();

        let report = fx.consumer.cleanup().await.unwrap();
        assert_eq!(report.objects_deleted, 1);
        assert_eq!(report.urls_deleted, 1);
    }
}
