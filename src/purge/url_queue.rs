//! Queue of resolved, dispatch-ready purge targets.

use serde::Serialize;
use tracing::debug;

use crate::{
    domain::{entities::ParentRef, references::PurgeTarget},
    queue::{Enqueued, Queue, QueueError, QueueItem},
};

use super::dispatcher::DispatchReport;

/// Bookkeeping applied after a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Settled {
    pub completed: u64,
    pub retried: u64,
}

#[derive(Debug, Clone)]
pub struct UrlQueue {
    queue: Queue<PurgeTarget>,
}

impl UrlQueue {
    pub fn new(queue: Queue<PurgeTarget>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Queue<PurgeTarget> {
        &self.queue
    }

    /// Enqueue a target unless an equal one is already waiting.
    pub async fn add(
        &self,
        target: &PurgeTarget,
        parent: Option<&ParentRef>,
    ) -> Result<Enqueued<PurgeTarget>, QueueError> {
        self.queue.add_unique(target, parent).await
    }

    /// The waiting purge-all marker, if any.
    pub async fn pending_purge_all(&self) -> Result<Option<QueueItem<PurgeTarget>>, QueueError> {
        self.queue.find_available(PurgeTarget::purge_all_key()).await
    }

    /// Claim up to `limit` targets that still have attempts left.
    pub async fn reserve_batch(
        &self,
        limit: u32,
        max_attempts: i32,
    ) -> Result<Vec<QueueItem<PurgeTarget>>, QueueError> {
        self.queue.reserve_retryable(limit, max_attempts, false).await
    }

    /// Complete the items the report covers; release the rest for a retry and
    /// count the attempt.
    pub async fn settle(
        &self,
        items: &[QueueItem<PurgeTarget>],
        report: &DispatchReport,
    ) -> Result<Settled, QueueError> {
        let (delivered, undelivered): (Vec<_>, Vec<_>) = items
            .iter()
            .cloned()
            .partition(|item| report.covers(&item.payload));

        let completed = self.queue.complete_items(&delivered).await?;
        let mut retried = 0;
        for item in &undelivered {
            self.queue.release_item(item).await?;
            if let Some(item) = self.queue.do_attempt(item).await? {
                retried += 1;
                debug!(item_id = item.id, attempts = item.attempts, target = %item.payload, "purge target released for retry");
            }
        }
        Ok(Settled { completed, retried })
    }
}
