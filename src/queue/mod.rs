//! Durable FIFO job queue partitioned by name.
//!
//! A [`Queue`] is a typed handle over one `queue_name` partition of the shared
//! queue table. Every item-scoped operation is checked against the handle's
//! name, so two handles over the same store never touch each other's rows.
//! Concurrent consumers are safe because claims happen in a single storage
//! statement; there is no in-process locking.

mod item;

pub use item::{ItemSummary, QueueItem};

use std::{marker::PhantomData, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    application::repos::{ItemQuery, NewQueueItem, QueueRepo, RepoError},
    domain::{
        entities::{ParentRef, QueueItemRecord},
        references::{ContentReference, PurgeTarget},
        types::ItemState,
    },
};

/// Attempts after which an unfinished item is cut off.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;
/// Items flagged failed per sweep.
pub const DEFAULT_FLAG_BATCH: u32 = 100;
/// Rows removed per statement by the age sweep.
const SWEEP_BATCH: u32 = 500;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("item {id} in queue `{queue}` holds an unreadable payload: {source}")]
    Payload {
        queue: String,
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload cannot be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Payload stored in a queue.
pub trait QueuePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity used to collapse an enqueue onto an already-available item.
    fn dedup_key(&self) -> String;
}

impl QueuePayload for ContentReference {
    fn dedup_key(&self) -> String {
        ContentReference::dedup_key(self)
    }
}

impl QueuePayload for PurgeTarget {
    fn dedup_key(&self) -> String {
        PurgeTarget::dedup_key(self)
    }
}

/// Result of [`Queue::add_unique`].
#[derive(Debug, Clone)]
pub struct Enqueued<P> {
    pub item: QueueItem<P>,
    /// `false` when an equal available item was returned instead.
    pub inserted: bool,
}

pub struct Queue<P> {
    name: Arc<str>,
    repo: Arc<dyn QueueRepo>,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Clone for Queue<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            repo: self.repo.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P> std::fmt::Debug for Queue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.name).finish()
    }
}

impl<P: QueuePayload> Queue<P> {
    pub fn new(name: impl Into<Arc<str>>, repo: Arc<dyn QueueRepo>) -> Self {
        Self {
            name: name.into(),
            repo,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn owns<T>(&self, item: &QueueItem<T>) -> bool {
        item.queue_name == *self.name
    }

    fn decode(&self, record: QueueItemRecord) -> Result<QueueItem<P>, QueueError> {
        QueueItem::decode(record)
    }

    fn decode_opt(
        &self,
        record: Option<QueueItemRecord>,
    ) -> Result<Option<QueueItem<P>>, QueueError> {
        record.map(|record| self.decode(record)).transpose()
    }

    fn decode_all(&self, records: Vec<QueueItemRecord>) -> Result<Vec<QueueItem<P>>, QueueError> {
        records
            .into_iter()
            .map(|record| self.decode(record))
            .collect()
    }

    fn new_item(
        &self,
        payload: &P,
        parent: Option<&ParentRef>,
    ) -> Result<NewQueueItem, QueueError> {
        Ok(NewQueueItem {
            queue_name: self.name.to_string(),
            payload: serde_json::to_value(payload).map_err(QueueError::Encode)?,
            dedup_key: payload.dedup_key(),
            parent: parent.cloned(),
            created_at: OffsetDateTime::now_utc(),
        })
    }

    /// Insert a new available item, regardless of duplicates.
    pub async fn add(
        &self,
        payload: &P,
        parent: Option<&ParentRef>,
    ) -> Result<QueueItem<P>, QueueError> {
        let record = self
            .repo
            .insert_item(self.new_item(payload, parent)?)
            .await?;
        self.decode(record)
    }

    /// Insert unless an available item with the same dedup key exists, in
    /// which case that item is returned.
    pub async fn add_unique(
        &self,
        payload: &P,
        parent: Option<&ParentRef>,
    ) -> Result<Enqueued<P>, QueueError> {
        let enqueued = self
            .repo
            .insert_unless_available(self.new_item(payload, parent)?)
            .await?;
        if !enqueued.inserted {
            debug!(
                queue = %self.name,
                item_id = enqueued.record.id,
                dedup_key = %enqueued.record.dedup_key,
                "enqueue collapsed onto available item"
            );
        }
        Ok(Enqueued {
            item: self.decode(enqueued.record)?,
            inserted: enqueued.inserted,
        })
    }

    /// Item by id, if it exists in this queue.
    pub async fn get(&self, id: i64) -> Result<Option<QueueItem<P>>, QueueError> {
        let record = self
            .repo
            .find_item(id)
            .await?
            .filter(|record| record.queue_name == *self.name);
        self.decode_opt(record)
    }

    /// Oldest available item with the given dedup key.
    pub async fn find_available(&self, dedup_key: &str) -> Result<Option<QueueItem<P>>, QueueError> {
        let record = self.repo.find_available_by_key(&self.name, dedup_key).await?;
        self.decode_opt(record)
    }

    pub async fn item_exists(&self, id: i64) -> Result<bool, QueueError> {
        Ok(self
            .repo
            .find_item(id)
            .await?
            .is_some_and(|record| record.queue_name == *self.name))
    }

    /// Claim one available item. `None` when it belongs to another queue or is
    /// no longer available.
    pub async fn reserve_item(
        &self,
        item: &QueueItem<P>,
        increment_attempts: bool,
    ) -> Result<Option<QueueItem<P>>, QueueError> {
        if !self.owns(item) {
            return Ok(None);
        }
        let record = self
            .repo
            .reserve_item(
                &self.name,
                item.id,
                increment_attempts,
                OffsetDateTime::now_utc(),
            )
            .await?;
        self.decode_opt(record)
    }

    /// Claim up to `limit` available items, oldest first.
    pub async fn reserve_items(
        &self,
        limit: u32,
        increment_attempts: bool,
    ) -> Result<Vec<QueueItem<P>>, QueueError> {
        self.claim(limit, None, increment_attempts).await
    }

    /// Like [`reserve_items`](Self::reserve_items), skipping items that
    /// already made `max_attempts` attempts and wait to be flagged failed.
    pub async fn reserve_retryable(
        &self,
        limit: u32,
        max_attempts: i32,
        increment_attempts: bool,
    ) -> Result<Vec<QueueItem<P>>, QueueError> {
        self.claim(limit, Some(max_attempts), increment_attempts)
            .await
    }

    async fn claim(
        &self,
        limit: u32,
        max_attempts: Option<i32>,
        increment_attempts: bool,
    ) -> Result<Vec<QueueItem<P>>, QueueError> {
        let records = self
            .repo
            .reserve_items(
                &self.name,
                limit,
                max_attempts,
                increment_attempts,
                OffsetDateTime::now_utc(),
            )
            .await?;
        self.decode_all(records)
    }

    pub async fn complete_item(
        &self,
        item: &QueueItem<P>,
    ) -> Result<Option<QueueItem<P>>, QueueError> {
        if !self.owns(item) {
            return Ok(None);
        }
        let record = self
            .repo
            .complete_item(&self.name, item.id, OffsetDateTime::now_utc())
            .await?;
        self.decode_opt(record)
    }

    /// Complete a batch; items from other queues are skipped.
    pub async fn complete_items(&self, items: &[QueueItem<P>]) -> Result<u64, QueueError> {
        let ids: Vec<i64> = items
            .iter()
            .filter(|item| self.owns(item))
            .map(|item| item.id)
            .collect();
        Ok(self
            .repo
            .complete_items(&self.name, &ids, OffsetDateTime::now_utc())
            .await?)
    }

    /// Id of the newest item, if the queue holds any.
    pub async fn last_item_id(&self) -> Result<Option<i64>, QueueError> {
        Ok(self.repo.last_item_id(&self.name).await?)
    }

    /// Retire every item up to `up_to_id` that is still waiting to be picked up.
    pub async fn complete_available(&self, up_to_id: i64) -> Result<u64, QueueError> {
        Ok(self
            .repo
            .complete_available(&self.name, up_to_id, OffsetDateTime::now_utc())
            .await?)
    }

    pub async fn release_item(
        &self,
        item: &QueueItem<P>,
    ) -> Result<Option<QueueItem<P>>, QueueError> {
        if !self.owns(item) {
            return Ok(None);
        }
        let record = self.repo.release_item(&self.name, item.id).await?;
        self.decode_opt(record)
    }

    /// Count one more attempt without touching reservation state.
    pub async fn do_attempt(
        &self,
        item: &QueueItem<P>,
    ) -> Result<Option<QueueItem<P>>, QueueError> {
        if !self.owns(item) {
            return Ok(None);
        }
        let record = self.repo.record_attempt(&self.name, item.id).await?;
        self.decode_opt(record)
    }

    /// Mark at most `batch_size` available items with `attempts >= threshold`
    /// as failed.
    pub async fn flag_max_attempted_items_as_failed(
        &self,
        threshold: i32,
        batch_size: u32,
    ) -> Result<u64, QueueError> {
        let flagged = self
            .repo
            .flag_exhausted(&self.name, threshold, batch_size, OffsetDateTime::now_utc())
            .await?;
        if flagged > 0 {
            debug!(queue = %self.name, flagged, threshold, "flagged exhausted items");
        }
        Ok(flagged)
    }

    /// Release reservations older than `older_than` that never finished.
    pub async fn release_stale_reservations(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        Ok(self.repo.release_stale(&self.name, cutoff).await?)
    }

    pub async fn count_items(&self) -> Result<u64, QueueError> {
        Ok(self.repo.count_items(&self.name, None).await?)
    }

    pub async fn count_available_items(&self) -> Result<u64, QueueError> {
        self.count_in(ItemState::Available).await
    }

    pub async fn count_reserved_items(&self) -> Result<u64, QueueError> {
        self.count_in(ItemState::Reserved).await
    }

    pub async fn count_completed_items(&self) -> Result<u64, QueueError> {
        self.count_in(ItemState::Completed).await
    }

    pub async fn count_failed_items(&self) -> Result<u64, QueueError> {
        self.count_in(ItemState::Failed).await
    }

    async fn count_in(&self, state: ItemState) -> Result<u64, QueueError> {
        Ok(self.repo.count_items(&self.name, Some(state)).await?)
    }

    /// Items oldest first; 30 per page unless the query sets a limit.
    pub async fn get_items(&self, query: &ItemQuery) -> Result<Vec<QueueItem<P>>, QueueError> {
        let records = self.repo.list_items(&self.name, query).await?;
        self.decode_all(records)
    }

    pub async fn delete_item(&self, id: i64) -> Result<bool, QueueError> {
        Ok(self.repo.delete_item(&self.name, id).await?)
    }

    pub async fn delete_items(&self, ids: &[i64]) -> Result<u64, QueueError> {
        Ok(self.repo.delete_items(&self.name, ids).await?)
    }

    /// Delete every item created before `cutoff`, in bounded statements.
    pub async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, QueueError> {
        let mut deleted = 0;
        loop {
            let removed = self
                .repo
                .delete_older_than(&self.name, cutoff, SWEEP_BATCH)
                .await?;
            deleted += removed;
            if removed < u64::from(SWEEP_BATCH) {
                return Ok(deleted);
            }
        }
    }

    pub async fn clear_queue(&self) -> Result<u64, QueueError> {
        Ok(self.repo.clear_queue(&self.name).await?)
    }

    /// The item that produced `item`, if it still exists. Parents may live in
    /// any queue, so the payload stays undecoded.
    pub async fn parent_of(
        &self,
        item: &QueueItem<P>,
    ) -> Result<Option<QueueItemRecord>, QueueError> {
        let Some(parent) = item.parent.as_ref() else {
            return Ok(None);
        };
        Ok(self
            .repo
            .find_item(parent.id)
            .await?
            .filter(|record| record.queue_name == parent.queue_name))
    }

    /// Items in any queue that were produced by `item`.
    pub async fn children_of(
        &self,
        item: &QueueItem<P>,
        query: &ItemQuery,
    ) -> Result<Vec<QueueItemRecord>, QueueError> {
        Ok(self.repo.list_children(&item.as_parent(), query).await?)
    }
}
