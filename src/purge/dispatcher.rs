//! Sends purge targets to the active driver in provider-sized chunks.

use std::{collections::HashSet, sync::Arc};

use metrics::counter;
use tracing::{info, instrument, warn};

use crate::domain::references::PurgeTarget;

use super::driver::{DriverError, PurgeDriver};

const METRIC_DISPATCH_CHUNKS: &str = "edgepurge_dispatch_chunks_total";
const METRIC_DISPATCH_FAILURES: &str = "edgepurge_dispatch_failures_total";

/// Outcome of one [`Dispatcher::dispatch`] call.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// A purge-all request superseded the batch.
    pub purged_all: bool,
    pub chunks_sent: usize,
    /// Targets known to be purged upstream, duplicates removed.
    pub delivered: Vec<PurgeTarget>,
    /// Targets in the failed chunk and every chunk after it.
    pub undelivered: Vec<PurgeTarget>,
    /// Specific targets dropped because a purge-all covered them.
    pub coalesced: usize,
    pub error: Option<DriverError>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether `target` is covered by what was sent successfully.
    pub fn covers(&self, target: &PurgeTarget) -> bool {
        (self.purged_all && self.is_success()) || self.delivered.contains(target)
    }
}

pub struct Dispatcher {
    driver: Arc<dyn PurgeDriver>,
    batch_size_cap: Option<usize>,
}

impl Dispatcher {
    pub fn new(driver: Arc<dyn PurgeDriver>, batch_size_cap: Option<usize>) -> Self {
        Self {
            driver,
            batch_size_cap,
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.descriptor().name
    }

    /// Chunk size: the driver's limit, lowered by the configured cap.
    pub fn batch_size(&self) -> usize {
        let max = self.driver.max_urls_per_batch();
        self.batch_size_cap
            .map_or(max, |cap| cap.min(max))
            .max(1)
    }

    /// Purge `targets`, coalescing onto a single purge-all when one is present.
    ///
    /// Chunks go out one at a time. The first failed chunk stops the run; chunks
    /// already sent stay delivered.
    #[instrument(skip_all, fields(driver = self.driver_name(), targets = targets.len()))]
    pub async fn dispatch(&self, targets: &[PurgeTarget]) -> DispatchReport {
        let targets = dedup(targets);
        if targets.is_empty() {
            return DispatchReport::default();
        }

        if targets.iter().any(PurgeTarget::is_purge_all) {
            return self.dispatch_purge_all(targets).await;
        }

        let batch_size = self.batch_size();
        let (urls, tags): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .partition(|target| matches!(target, PurgeTarget::Url(_)));

        let mut report = DispatchReport::default();
        let chunks = urls
            .chunks(batch_size)
            .map(|chunk| (ChunkKind::Urls, chunk))
            .chain(tags.chunks(batch_size).map(|chunk| (ChunkKind::Tags, chunk)));

        for (kind, chunk) in chunks {
            if report.error.is_some() {
                report.undelivered.extend_from_slice(chunk);
                continue;
            }

            let values: Vec<String> = chunk.iter().map(target_value).collect();
            let result = match kind {
                ChunkKind::Urls => self.driver.purge_by_urls(&values).await,
                ChunkKind::Tags => self.driver.purge_by_tags(&values).await,
            };
            report.chunks_sent += 1;
            counter!(METRIC_DISPATCH_CHUNKS, "driver" => self.driver_name()).increment(1);

            match result {
                Ok(()) => report.delivered.extend_from_slice(chunk),
                Err(err) => {
                    counter!(METRIC_DISPATCH_FAILURES, "driver" => self.driver_name())
                        .increment(1);
                    warn!(
                        chunk = report.chunks_sent,
                        size = chunk.len(),
                        error = %err,
                        "purge chunk failed; remaining chunks deferred"
                    );
                    report.undelivered.extend_from_slice(chunk);
                    report.error = Some(err);
                }
            }
        }

        info!(
            chunks_sent = report.chunks_sent,
            delivered = report.delivered.len(),
            undelivered = report.undelivered.len(),
            batch_size,
            "dispatch finished"
        );
        report
    }

    async fn dispatch_purge_all(&self, targets: Vec<PurgeTarget>) -> DispatchReport {
        let coalesced = targets.iter().filter(|t| !t.is_purge_all()).count();
        let mut report = DispatchReport {
            purged_all: true,
            chunks_sent: 1,
            coalesced,
            ..DispatchReport::default()
        };

        counter!(METRIC_DISPATCH_CHUNKS, "driver" => self.driver_name()).increment(1);
        match self.driver.purge_all().await {
            Ok(()) => {
                info!(coalesced, "purged everything");
                report.delivered = targets;
            }
            Err(err) => {
                counter!(METRIC_DISPATCH_FAILURES, "driver" => self.driver_name()).increment(1);
                warn!(error = %err, "purge-all failed");
                report.undelivered = targets;
                report.error = Some(err);
            }
        }
        report
    }
}

#[derive(Clone, Copy)]
enum ChunkKind {
    Urls,
    Tags,
}

fn target_value(target: &PurgeTarget) -> String {
    match target {
        PurgeTarget::Url(value) | PurgeTarget::CacheTag(value) => value.clone(),
        PurgeTarget::All => String::new(),
    }
}

/// Drop repeated targets, keeping first-seen order.
fn dedup(targets: &[PurgeTarget]) -> Vec<PurgeTarget> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|target| seen.insert(*target))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purge::driver::testing::{Call, RecordingDriver};

    fn urls(count: usize) -> Vec<PurgeTarget> {
        (0..count)
            .map(|n| PurgeTarget::Url(format!("https://site.test/{n}/")))
            .collect()
    }

    fn dispatcher(driver: &Arc<RecordingDriver>, cap: Option<usize>) -> Dispatcher {
        Dispatcher::new(driver.clone(), cap)
    }

    #[tokio::test]
    async fn chunks_to_driver_limit_of_thirty() {
        let driver = Arc::new(RecordingDriver::new(30));
        let report = dispatcher(&driver, None).dispatch(&urls(150)).await;

        let calls = driver.calls();
        assert_eq!(calls.len(), 5);
        assert!(
            calls
                .iter()
                .all(|call| matches!(call, Call::Urls(batch) if batch.len() == 30))
        );
        assert_eq!(report.chunks_sent, 5);
        assert_eq!(report.delivered.len(), 150);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn chunks_to_driver_limit_of_five_hundred() {
        let driver = Arc::new(RecordingDriver::new(500));
        dispatcher(&driver, None).dispatch(&urls(600)).await;

        let sizes: Vec<usize> = driver
            .calls()
            .iter()
            .map(|call| match call {
                Call::Urls(batch) => batch.len(),
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        assert_eq!(sizes, [500, 100]);
    }

    #[tokio::test]
    async fn purge_all_coalesces_specific_targets() {
        let driver = Arc::new(RecordingDriver::new(30));
        let mut targets = urls(10);
        targets.insert(4, PurgeTarget::All);

        let report = dispatcher(&driver, None).dispatch(&targets).await;

        assert_eq!(driver.calls(), vec![Call::All]);
        assert!(report.purged_all);
        assert_eq!(report.coalesced, 10);
        assert!(report.covers(&PurgeTarget::Url("https://site.test/3/".to_string())));
    }

    #[tokio::test]
    async fn cap_lowers_effective_batch_size() {
        let driver = Arc::new(RecordingDriver::new(30));
        let dispatcher = dispatcher(&driver, Some(7));
        assert_eq!(dispatcher.batch_size(), 7);
        dispatcher.dispatch(&urls(20)).await;
        assert_eq!(driver.calls().len(), 3);

        let generous = Dispatcher::new(driver.clone(), Some(1_000));
        assert_eq!(generous.batch_size(), 30);
    }

    #[tokio::test]
    async fn first_failed_chunk_stops_the_run() {
        let driver = Arc::new(RecordingDriver::new(10));
        driver.fail_on(Some(1));

        let report = dispatcher(&driver, None).dispatch(&urls(35)).await;

        assert_eq!(driver.calls().len(), 2);
        assert_eq!(report.chunks_sent, 2);
        assert_eq!(report.delivered.len(), 10);
        assert_eq!(report.undelivered.len(), 25);
        assert!(matches!(report.error, Some(DriverError::Rejected { .. })));
    }

    #[tokio::test]
    async fn urls_and_tags_are_sent_separately_after_dedup() {
        let driver = Arc::new(RecordingDriver::new(30));
        let targets = vec![
            PurgeTarget::CacheTag("site-post-1".to_string()),
            PurgeTarget::Url("https://site.test/a/".to_string()),
            PurgeTarget::Url("https://site.test/a/".to_string()),
            PurgeTarget::CacheTag("site-post-1".to_string()),
        ];

        let report = dispatcher(&driver, None).dispatch(&targets).await;

        assert_eq!(
            driver.calls(),
            vec![
                Call::Urls(vec!["https://site.test/a/".to_string()]),
                Call::Tags(vec!["site-post-1".to_string()]),
            ]
        );
        assert_eq!(report.delivered.len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let driver = Arc::new(RecordingDriver::new(30));
        let report = dispatcher(&driver, None).dispatch(&[]).await;
        assert!(driver.calls().is_empty());
        assert!(report.is_success());
        assert_eq!(report.chunks_sent, 0);
    }
}
