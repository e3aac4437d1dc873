//! Wiring of queues, resolver, dispatcher, trigger and consumer for one site.

use std::sync::Arc;

use serde::Serialize;

use crate::{
    application::repos::{ContentRepo, ItemQuery, QueueRepo},
    purge::{
        Dispatcher, ObjectQueue, PurgeConfig, PurgeConsumer, PurgeDriver, PurgeTrigger, QueueKind,
        Resolver, ResolverConfig, UrlQueue, queue_names,
    },
    queue::{ItemSummary, Queue, QueueError},
};

/// Counts per state for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: QueueKind,
    pub name: String,
    pub total: u64,
    pub available: u64,
    pub reserved: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct Pipeline {
    objects: ObjectQueue,
    urls: UrlQueue,
    trigger: Arc<PurgeTrigger>,
    consumer: Arc<PurgeConsumer>,
}

impl Pipeline {
    /// `driver` is `None` when purging is not configured; the trigger and the
    /// consumer then refuse to run while queue inspection keeps working.
    pub fn new(
        queue_key: &str,
        queues: Arc<dyn QueueRepo>,
        content: Arc<dyn ContentRepo>,
        resolver_config: ResolverConfig,
        config: PurgeConfig,
        driver: Option<Arc<dyn PurgeDriver>>,
    ) -> Self {
        let (objects_name, urls_name) = queue_names(queue_key);
        let objects = ObjectQueue::new(Queue::new(objects_name, queues.clone()));
        let urls = UrlQueue::new(Queue::new(urls_name, queues));
        let resolver = Arc::new(Resolver::new(resolver_config, content));
        let dispatcher =
            driver.map(|driver| Arc::new(Dispatcher::new(driver, config.batch_size_cap)));

        let trigger = Arc::new(PurgeTrigger::new(
            config.mode,
            objects.clone(),
            resolver.clone(),
            dispatcher.clone(),
        ));
        let consumer = Arc::new(PurgeConsumer::new(
            config,
            objects.clone(),
            urls.clone(),
            resolver,
            dispatcher,
        ));

        Self {
            objects,
            urls,
            trigger,
            consumer,
        }
    }

    pub fn trigger(&self) -> &Arc<PurgeTrigger> {
        &self.trigger
    }

    pub fn consumer(&self) -> &Arc<PurgeConsumer> {
        &self.consumer
    }

    pub fn objects(&self) -> &ObjectQueue {
        &self.objects
    }

    pub fn urls(&self) -> &UrlQueue {
        &self.urls
    }

    pub fn queue_name(&self, kind: QueueKind) -> &str {
        match kind {
            QueueKind::Objects => self.objects.queue().name(),
            QueueKind::Urls => self.urls.queue().name(),
        }
    }

    pub async fn stats(&self, kind: QueueKind) -> Result<QueueStats, QueueError> {
        match kind {
            QueueKind::Objects => stats_of(kind, self.objects.queue()).await,
            QueueKind::Urls => stats_of(kind, self.urls.queue()).await,
        }
    }

    pub async fn list_items(
        &self,
        kind: QueueKind,
        query: &ItemQuery,
    ) -> Result<Vec<ItemSummary>, QueueError> {
        let items = match kind {
            QueueKind::Objects => summaries(self.objects.queue().get_items(query).await?),
            QueueKind::Urls => summaries(self.urls.queue().get_items(query).await?),
        };
        Ok(items)
    }

    pub async fn delete_item(&self, kind: QueueKind, id: i64) -> Result<bool, QueueError> {
        match kind {
            QueueKind::Objects => self.objects.queue().delete_item(id).await,
            QueueKind::Urls => self.urls.queue().delete_item(id).await,
        }
    }

    /// Delete the given items of one queue; ids from other queues are ignored.
    pub async fn delete_items(&self, kind: QueueKind, ids: &[i64]) -> Result<u64, QueueError> {
        match kind {
            QueueKind::Objects => self.objects.queue().delete_items(ids).await,
            QueueKind::Urls => self.urls.queue().delete_items(ids).await,
        }
    }

    pub async fn clear(&self, kind: QueueKind) -> Result<u64, QueueError> {
        match kind {
            QueueKind::Objects => self.objects.queue().clear_queue().await,
            QueueKind::Urls => self.urls.queue().clear_queue().await,
        }
    }
}

async fn stats_of<P>(kind: QueueKind, queue: &Queue<P>) -> Result<QueueStats, QueueError>
where
    P: crate::queue::QueuePayload,
{
    let (total, available, reserved, completed, failed) = futures::try_join!(
        queue.count_items(),
        queue.count_available_items(),
        queue.count_reserved_items(),
        queue.count_completed_items(),
        queue.count_failed_items(),
    )?;

    Ok(QueueStats {
        queue: kind,
        name: queue.name().to_string(),
        total,
        available,
        reserved,
        completed,
        failed,
    })
}

fn summaries<P: Serialize>(items: Vec<crate::queue::QueueItem<P>>) -> Vec<ItemSummary> {
    items.iter().map(|item| item.summary()).collect()
}
