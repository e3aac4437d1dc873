//! Queue of content references awaiting resolution.

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    domain::references::{ContentReference, PurgeTarget},
    queue::{Enqueued, Queue, QueueError, QueueItem},
};

use super::{resolver::Resolver, url_queue::UrlQueue};

/// Outcome of one [`ObjectQueue::parse_queue`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    pub reserved: usize,
    pub parsed: usize,
    /// Items released for a retry because resolution failed.
    pub failed: usize,
    /// New URL-queue items; targets that collapsed onto waiting ones are not counted.
    pub targets_enqueued: usize,
    pub purge_all: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectQueue {
    queue: Queue<ContentReference>,
}

impl ObjectQueue {
    pub fn new(queue: Queue<ContentReference>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Queue<ContentReference> {
        &self.queue
    }

    /// Enqueue a reference; an equal reference still waiting is returned instead.
    pub async fn add(
        &self,
        reference: &ContentReference,
    ) -> Result<Enqueued<ContentReference>, QueueError> {
        self.queue.add_unique(reference, None).await
    }

    /// Resolve up to `batch_size` waiting references into the URL queue.
    /// References that already made `max_attempts` attempts are left for the
    /// failure sweep.
    ///
    /// Each produced target points back at its reference. A reference that
    /// fails to resolve is released and its attempt counted. A purge-all
    /// reference becomes the purge-all marker; other references are still
    /// parsed and the dispatcher drops them later.
    pub async fn parse_queue(
        &self,
        resolver: &Resolver,
        urls: &UrlQueue,
        batch_size: u32,
        max_attempts: i32,
    ) -> Result<ParseReport, QueueError> {
        let items = self
            .queue
            .reserve_retryable(batch_size, max_attempts, false)
            .await?;
        let mut report = ParseReport {
            reserved: items.len(),
            ..ParseReport::default()
        };

        for item in items {
            let targets = match resolver.resolve(&item.payload).await {
                Ok(targets) => targets,
                Err(err) => {
                    warn!(item_id = item.id, reference = %item.payload, error = %err, "reference could not be resolved");
                    self.retry(&item).await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.enqueue_targets(&item, &targets, urls).await {
                Ok(enqueued) => report.targets_enqueued += enqueued,
                Err(err) => {
                    self.retry(&item).await?;
                    return Err(err);
                }
            }

            report.purge_all |= targets.iter().any(PurgeTarget::is_purge_all);
            self.queue.complete_item(&item).await?;
            report.parsed += 1;
            debug!(item_id = item.id, reference = %item.payload, targets = targets.len(), "reference parsed");
        }

        Ok(report)
    }

    async fn enqueue_targets(
        &self,
        item: &QueueItem<ContentReference>,
        targets: &[PurgeTarget],
        urls: &UrlQueue,
    ) -> Result<usize, QueueError> {
        let parent = item.as_parent();
        let mut inserted = 0;
        for target in targets {
            if urls.add(target, Some(&parent)).await?.inserted {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn retry(&self, item: &QueueItem<ContentReference>) -> Result<(), QueueError> {
        self.queue.release_item(item).await?;
        self.queue.do_attempt(item).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::macros::datetime;
    use url::Url;

    use super::*;
    use crate::{
        application::repos::{ContentWriteRepo, ItemQuery, QueueRepo, UpsertPostParams},
        domain::types::PostStatus,
        infra::db::SqliteRepositories,
        purge::resolver::ResolverConfig,
        queue::DEFAULT_MAX_ATTEMPTS,
    };

    struct Fixture {
        objects: ObjectQueue,
        urls: UrlQueue,
        resolver: Resolver,
    }

    async fn fixture() -> Fixture {
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
        let config = ResolverConfig::new(Url::parse("https://site.test/").unwrap());
        Fixture {
            objects: ObjectQueue::new(Queue::new("site_purge_objects", queue_repo.clone())),
            urls: UrlQueue::new(Queue::new("site_purge_urls", queue_repo)),
            resolver: Resolver::new(config, repos),
        }
    }

    #[tokio::test]
    async fn duplicate_references_are_collapsed() {
        let fx = fixture().await;
        let first = fx.objects.add(&ContentReference::Post(1)).await.unwrap();
        let second = fx.objects.add(&ContentReference::Post(1)).await.unwrap();
        assert_eq!(first.item.id, second.item.id);
        assert!(!second.inserted);
        assert_eq!(fx.objects.queue().count_items().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn parse_moves_targets_with_parent_links() {
        let fx = fixture().await;
        let reference = fx.objects.add(&ContentReference::Post(1)).await.unwrap().item;

        let report = fx
            .objects
            .parse_queue(&fx.resolver, &fx.urls, 10, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        assert_eq!(report.parsed, 1);
        assert!(report.targets_enqueued > 1);
        assert_eq!(fx.objects.queue().count_completed_items().await.unwrap(), 1);

        let queued = fx
            .urls
            .queue()
            .get_items(&ItemQuery {
                limit: Some(100),
                ..ItemQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), report.targets_enqueued);
        assert_eq!(
            queued[0].payload,
            PurgeTarget::Url("https://site.test/2024/05/01/hello/".to_string())
        );
        assert!(queued.iter().all(|item| item.parent == Some(reference.as_parent())));

        let parent = fx.urls.queue().parent_of(&queued[0]).await.unwrap().unwrap();
        assert_eq!(parent.id, reference.id);
    }

    #[tokio::test]
    async fn resolution_failure_releases_and_counts_attempt() {
        let fx = fixture().await;
        fx.objects.add(&ContentReference::Post(404)).await.unwrap();

        let report = fx
            .objects
            .parse_queue(&fx.resolver, &fx.urls, 10, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.parsed, 0);
        let item = fx.objects.queue().reserve_items(1, false).await.unwrap().remove(0);
        assert_eq!(item.attempts, 1);
        assert_eq!(fx.urls.queue().count_items().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_all_reference_becomes_marker() {
        let fx = fixture().await;
        fx.objects.add(&ContentReference::All).await.unwrap();
        fx.objects.add(&ContentReference::Post(1)).await.unwrap();

        let report = fx
            .objects
            .parse_queue(&fx.resolver, &fx.urls, 10, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        assert!(report.purge_all);
        assert_eq!(report.parsed, 2);
        assert!(fx.urls.pending_purge_all().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn parse_is_bounded_by_batch_size() {
        let fx = fixture().await;
        for n in 0..5 {
            fx.objects
                .add(&ContentReference::Url(format!("/page-{n}/")))
                .await
                .unwrap();
        }

        let report = fx
            .objects
            .parse_queue(&fx.resolver, &fx.urls, 2, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();
        assert_eq!(report.reserved, 2);
        assert_eq!(fx.objects.queue().count_available_items().await.unwrap(), 3);
    }
}
