//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{DateArchive, ParentRef, PostRecord, QueueItemRecord, TermRecord};
use crate::domain::types::{ItemState, PostStatus};

/// Page size applied to item listings that do not ask for one.
pub const DEFAULT_ITEM_PAGE_SIZE: u32 = 30;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub dedup_key: String,
    pub parent: Option<ParentRef>,
    pub created_at: OffsetDateTime,
}

/// Outcome of a dedup-aware insert.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub record: QueueItemRecord,
    /// `false` when an available item with the same dedup key already existed.
    pub inserted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub state: Option<ItemState>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl ItemQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_ITEM_PAGE_SIZE).max(1)
    }
}

/// Storage contract for the queue table.
///
/// Every item-scoped mutation is constrained to `queue` and only touches rows
/// belonging to it; a foreign id yields `None`/`0` instead of an error.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    async fn insert_item(&self, item: NewQueueItem) -> Result<QueueItemRecord, RepoError>;

    /// Insert unless an available item with the same dedup key exists, in one statement.
    async fn insert_unless_available(&self, item: NewQueueItem) -> Result<Enqueued, RepoError>;

    async fn find_item(&self, id: i64) -> Result<Option<QueueItemRecord>, RepoError>;

    async fn find_available_by_key(
        &self,
        queue: &str,
        dedup_key: &str,
    ) -> Result<Option<QueueItemRecord>, RepoError>;

    async fn list_items(
        &self,
        queue: &str,
        query: &ItemQuery,
    ) -> Result<Vec<QueueItemRecord>, RepoError>;

    async fn list_children(
        &self,
        parent: &ParentRef,
        query: &ItemQuery,
    ) -> Result<Vec<QueueItemRecord>, RepoError>;

    /// Count items, optionally restricted to one lifecycle state.
    async fn count_items(&self, queue: &str, state: Option<ItemState>) -> Result<u64, RepoError>;

    async fn reserve_item(
        &self,
        queue: &str,
        id: i64,
        increment_attempts: bool,
        now: OffsetDateTime,
    ) -> Result<Option<QueueItemRecord>, RepoError>;

    /// Atomically claim up to `limit` available items, oldest first. With
    /// `max_attempts`, items that already used up their attempts are skipped.
    async fn reserve_items(
        &self,
        queue: &str,
        limit: u32,
        max_attempts: Option<i32>,
        increment_attempts: bool,
        now: OffsetDateTime,
    ) -> Result<Vec<QueueItemRecord>, RepoError>;

    async fn complete_item(
        &self,
        queue: &str,
        id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<QueueItemRecord>, RepoError>;

    async fn complete_items(
        &self,
        queue: &str,
        ids: &[i64],
        now: OffsetDateTime,
    ) -> Result<u64, RepoError>;

    /// Highest item id ever assigned in `queue`, if it holds any item.
    async fn last_item_id(&self, queue: &str) -> Result<Option<i64>, RepoError>;

    /// Complete every still-available item whose id is at most `up_to_id`.
    async fn complete_available(
        &self,
        queue: &str,
        up_to_id: i64,
        now: OffsetDateTime,
    ) -> Result<u64, RepoError>;

    async fn release_item(&self, queue: &str, id: i64)
    -> Result<Option<QueueItemRecord>, RepoError>;

    /// Release items reserved before `reserved_before` that never finished.
    async fn release_stale(
        &self,
        queue: &str,
        reserved_before: OffsetDateTime,
    ) -> Result<u64, RepoError>;

    async fn record_attempt(
        &self,
        queue: &str,
        id: i64,
    ) -> Result<Option<QueueItemRecord>, RepoError>;

    /// Flag at most `batch_size` unfinished items with `attempts >= threshold` as failed.
    async fn flag_exhausted(
        &self,
        queue: &str,
        threshold: i32,
        batch_size: u32,
        now: OffsetDateTime,
    ) -> Result<u64, RepoError>;

    async fn delete_item(&self, queue: &str, id: i64) -> Result<bool, RepoError>;

    async fn delete_items(&self, queue: &str, ids: &[i64]) -> Result<u64, RepoError>;

    /// Delete at most `limit` items created before `cutoff`, oldest first,
    /// whatever their state.
    async fn delete_older_than(
        &self,
        queue: &str,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<u64, RepoError>;

    async fn clear_queue(&self, queue: &str) -> Result<u64, RepoError>;
}

/// Archives whose published post count drives pagination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArchiveScope {
    /// The front page listing, which shows the given post types.
    Home { post_types: Vec<String> },
    PostType(String),
    Term(i64),
    Author(String),
    Date(DateArchive),
}

/// Read-only view of site content used by the resolver.
#[async_trait]
pub trait ContentRepo: Send + Sync {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError>;

    async fn find_term(&self, id: i64) -> Result<Option<TermRecord>, RepoError>;

    /// Number of publicly visible posts listed on the archive.
    async fn count_published(&self, scope: &ArchiveScope) -> Result<u64, RepoError>;
}

#[derive(Debug, Clone)]
pub struct UpsertPostParams {
    pub id: i64,
    pub slug: String,
    pub post_type: String,
    pub status: PostStatus,
    pub author_id: Option<i64>,
    pub published_at: Option<OffsetDateTime>,
    /// Replaces the post's term assignments.
    pub term_ids: Vec<i64>,
}

/// Keeps the local content mirror in step with the site.
#[async_trait]
pub trait ContentWriteRepo: Send + Sync {
    async fn upsert_author(&self, id: i64, slug: &str) -> Result<(), RepoError>;

    async fn upsert_term(&self, term: &TermRecord) -> Result<(), RepoError>;

    async fn upsert_post(&self, params: &UpsertPostParams) -> Result<(), RepoError>;

    async fn delete_post(&self, id: i64) -> Result<bool, RepoError>;

    async fn delete_term(&self, id: i64) -> Result<bool, RepoError>;
}
