use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};
use time::OffsetDateTime;

use crate::{
    application::repos::{Enqueued, ItemQuery, NewQueueItem, QueueRepo, RepoError},
    domain::{
        entities::{ParentRef, QueueItemRecord},
        types::ItemState,
    },
};

use super::{
    SqliteRepositories,
    query::{Condition, Delete, Order, Select, Update},
    util::{convert_count, from_micros, from_micros_opt, map_sqlx_error, to_micros},
};

const TABLE: &str = "queue_items";

const COLUMNS: &[&str] = &[
    "id",
    "queue_name",
    "payload",
    "dedup_key",
    "parent_id",
    "parent_queue_name",
    "attempts",
    "created_at",
    "reserved_at",
    "completed_at",
    "failed_at",
];

#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: i64,
    queue_name: String,
    payload: String,
    dedup_key: String,
    parent_id: Option<i64>,
    parent_queue_name: Option<String>,
    attempts: i64,
    created_at: i64,
    reserved_at: Option<i64>,
    completed_at: Option<i64>,
    failed_at: Option<i64>,
}

impl TryFrom<QueueItemRow> for QueueItemRecord {
    type Error = RepoError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload).map_err(|err| RepoError::Integrity {
            message: format!("queue item {} has an unreadable payload: {err}", row.id),
        })?;
        let parent = match (row.parent_queue_name, row.parent_id) {
            (Some(queue_name), Some(id)) => Some(ParentRef { queue_name, id }),
            _ => None,
        };
        let attempts = i32::try_from(row.attempts).map_err(|_| RepoError::Integrity {
            message: format!("queue item {} has an out-of-range attempt count", row.id),
        })?;

        Ok(Self {
            id: row.id,
            queue_name: row.queue_name,
            payload,
            dedup_key: row.dedup_key,
            parent,
            attempts,
            created_at: from_micros(row.created_at)?,
            reserved_at: from_micros_opt(row.reserved_at)?,
            completed_at: from_micros_opt(row.completed_at)?,
            failed_at: from_micros_opt(row.failed_at)?,
        })
    }
}

fn in_queue(queue: &str) -> Condition {
    Condition::eq("queue_name", queue)
}

fn in_state(state: ItemState) -> Condition {
    match state {
        ItemState::Available => Condition::all([
            Condition::is_null("reserved_at"),
            Condition::is_null("completed_at"),
            Condition::is_null("failed_at"),
        ]),
        ItemState::Reserved => Condition::all([
            Condition::is_not_null("reserved_at"),
            Condition::is_null("completed_at"),
            Condition::is_null("failed_at"),
        ]),
        ItemState::Completed => Condition::all([
            Condition::is_not_null("completed_at"),
            Condition::is_null("failed_at"),
        ]),
        ItemState::Failed => Condition::is_not_null("failed_at"),
    }
}

fn unfinished() -> Condition {
    Condition::all([
        Condition::is_null("completed_at"),
        Condition::is_null("failed_at"),
    ])
}

fn item(queue: &str, id: i64) -> Condition {
    Condition::all([Condition::eq("id", id), in_queue(queue)])
}

fn oldest_first(select: Select) -> Select {
    select
        .order_by("created_at", Order::Asc)
        .order_by("id", Order::Asc)
}

fn payload_text(item: &NewQueueItem) -> Result<String, RepoError> {
    serde_json::to_string(&item.payload).map_err(|err| RepoError::InvalidInput {
        message: format!("payload cannot be stored: {err}"),
    })
}

fn into_records(rows: Vec<QueueItemRow>) -> Result<Vec<QueueItemRecord>, RepoError> {
    rows.into_iter().map(QueueItemRecord::try_from).collect()
}

impl SqliteRepositories {
    async fn fetch_items(
        &self,
        mut qb: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<QueueItemRecord>, RepoError> {
        let rows = qb
            .build_query_as::<QueueItemRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        into_records(rows)
    }

    async fn fetch_item(
        &self,
        mut qb: QueryBuilder<'_, Sqlite>,
    ) -> Result<Option<QueueItemRecord>, RepoError> {
        let row = qb
            .build_query_as::<QueueItemRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.map(QueueItemRecord::try_from).transpose()
    }

    async fn execute_counted(&self, mut qb: QueryBuilder<'_, Sqlite>) -> Result<u64, RepoError> {
        let result = qb
            .build()
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    fn push_insert_head(qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(
            "INSERT INTO queue_items \
             (queue_name, payload, dedup_key, parent_id, parent_queue_name, attempts, created_at) ",
        );
    }

    fn push_insert_values(
        qb: &mut QueryBuilder<'_, Sqlite>,
        item: &NewQueueItem,
        payload: String,
    ) {
        qb.push_bind(item.queue_name.clone());
        qb.push(", ");
        qb.push_bind(payload);
        qb.push(", ");
        qb.push_bind(item.dedup_key.clone());
        qb.push(", ");
        qb.push_bind(item.parent.as_ref().map(|parent| parent.id));
        qb.push(", ");
        qb.push_bind(item.parent.as_ref().map(|parent| parent.queue_name.clone()));
        qb.push(", 0, ");
        qb.push_bind(to_micros(item.created_at));
    }
}

#[async_trait]
impl QueueRepo for SqliteRepositories {
    async fn insert_item(&self, item: NewQueueItem) -> Result<QueueItemRecord, RepoError> {
        let payload = payload_text(&item)?;
        let mut qb = QueryBuilder::new("");
        Self::push_insert_head(&mut qb);
        qb.push("VALUES (");
        Self::push_insert_values(&mut qb, &item, payload);
        qb.push(") RETURNING ");
        qb.push(COLUMNS.join(", "));

        self.fetch_item(qb).await?.ok_or(RepoError::NotFound)
    }

    async fn insert_unless_available(&self, item: NewQueueItem) -> Result<Enqueued, RepoError> {
        let payload = payload_text(&item)?;
        let existing = Select::from(TABLE).columns(&["1"]).filter(
            in_queue(&item.queue_name)
                .and(Condition::eq("dedup_key", &item.dedup_key))
                .and(in_state(ItemState::Available)),
        );

        let mut qb = QueryBuilder::new("");
        Self::push_insert_head(&mut qb);
        qb.push("SELECT ");
        Self::push_insert_values(&mut qb, &item, payload);
        qb.push(" WHERE NOT EXISTS (");
        existing.push_to(&mut qb);
        qb.push(") RETURNING ");
        qb.push(COLUMNS.join(", "));

        if let Some(record) = self.fetch_item(qb).await? {
            return Ok(Enqueued {
                record,
                inserted: true,
            });
        }

        match self
            .find_available_by_key(&item.queue_name, &item.dedup_key)
            .await?
        {
            Some(record) => Ok(Enqueued {
                record,
                inserted: false,
            }),
            // The blocking item was claimed in between; nothing available remains.
            None => Ok(Enqueued {
                record: self.insert_item(item).await?,
                inserted: true,
            }),
        }
    }

    async fn find_item(&self, id: i64) -> Result<Option<QueueItemRecord>, RepoError> {
        let qb = Select::from(TABLE)
            .columns(COLUMNS)
            .filter(Condition::eq("id", id))
            .build();
        self.fetch_item(qb).await
    }

    async fn find_available_by_key(
        &self,
        queue: &str,
        dedup_key: &str,
    ) -> Result<Option<QueueItemRecord>, RepoError> {
        let select = Select::from(TABLE).columns(COLUMNS).filter(
            in_queue(queue)
                .and(Condition::eq("dedup_key", dedup_key))
                .and(in_state(ItemState::Available)),
        );
        self.fetch_item(oldest_first(select).limit(1).build()).await
    }

    async fn list_items(
        &self,
        queue: &str,
        query: &ItemQuery,
    ) -> Result<Vec<QueueItemRecord>, RepoError> {
        let mut filter = in_queue(queue);
        if let Some(state) = query.state {
            filter = filter.and(in_state(state));
        }
        let select = oldest_first(Select::from(TABLE).columns(COLUMNS).filter(filter))
            .limit(query.effective_limit().into())
            .offset(query.offset.into());
        self.fetch_items(select.build()).await
    }

    async fn list_children(
        &self,
        parent: &ParentRef,
        query: &ItemQuery,
    ) -> Result<Vec<QueueItemRecord>, RepoError> {
        let mut filter = Condition::all([
            Condition::eq("parent_queue_name", &parent.queue_name),
            Condition::eq("parent_id", parent.id),
        ]);
        if let Some(state) = query.state {
            filter = filter.and(in_state(state));
        }
        let select = oldest_first(Select::from(TABLE).columns(COLUMNS).filter(filter))
            .limit(query.effective_limit().into())
            .offset(query.offset.into());
        self.fetch_items(select.build()).await
    }

    async fn count_items(&self, queue: &str, state: Option<ItemState>) -> Result<u64, RepoError> {
        let mut filter = in_queue(queue);
        if let Some(state) = state {
            filter = filter.and(in_state(state));
        }
        let mut qb = Select::count(TABLE).filter(filter).build();
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        convert_count(count)
    }

    async fn reserve_item(
        &self,
        queue: &str,
        id: i64,
        increment_attempts: bool,
        now: OffsetDateTime,
    ) -> Result<Option<QueueItemRecord>, RepoError> {
        let mut update = Update::table(TABLE).set("reserved_at", to_micros(now));
        if increment_attempts {
            update = update.set_expr("attempts", "attempts + 1");
        }
        let qb = update
            .filter(item(queue, id).and(in_state(ItemState::Available)))
            .returning(COLUMNS)
            .build();
        self.fetch_item(qb).await
    }

    async fn reserve_items(
        &self,
        queue: &str,
        limit: u32,
        max_attempts: Option<i32>,
        increment_attempts: bool,
        now: OffsetDateTime,
    ) -> Result<Vec<QueueItemRecord>, RepoError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = in_queue(queue).and(in_state(ItemState::Available));
        if let Some(max_attempts) = max_attempts {
            candidates = candidates.and(Condition::lt("attempts", max_attempts));
        }
        let claim = oldest_first(Select::from(TABLE).columns(&["id"]).filter(candidates))
            .limit(limit.into());

        let mut update = Update::table(TABLE).set("reserved_at", to_micros(now));
        if increment_attempts {
            update = update.set_expr("attempts", "attempts + 1");
        }
        let qb = update
            .filter(
                Condition::in_select("id", claim)
                    .and(Condition::is_null("reserved_at"))
                    .and(unfinished()),
            )
            .returning(COLUMNS)
            .build();

        let mut items = self.fetch_items(qb).await?;
        // RETURNING order is unspecified.
        items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(items)
    }

    async fn complete_item(
        &self,
        queue: &str,
        id: i64,
        now: OffsetDateTime,
    ) -> Result<Option<QueueItemRecord>, RepoError> {
        let stamp = to_micros(now);
        let qb = Update::table(TABLE)
            .set_if_null("reserved_at", stamp)
            .set_if_null("completed_at", stamp)
            .filter(item(queue, id).and(Condition::is_null("failed_at")))
            .returning(COLUMNS)
            .build();
        self.fetch_item(qb).await
    }

    async fn complete_items(
        &self,
        queue: &str,
        ids: &[i64],
        now: OffsetDateTime,
    ) -> Result<u64, RepoError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let stamp = to_micros(now);
        let qb = Update::table(TABLE)
            .set_if_null("reserved_at", stamp)
            .set("completed_at", stamp)
            .filter(Condition::all([
                in_queue(queue),
                Condition::is_in("id", ids.iter().copied()),
                unfinished(),
            ]))
            .build();
        self.execute_counted(qb).await
    }

    async fn last_item_id(&self, queue: &str) -> Result<Option<i64>, RepoError> {
        let mut qb = Select::from(TABLE)
            .columns(&["MAX(id)"])
            .filter(in_queue(queue))
            .build();
        qb.build_query_scalar::<Option<i64>>()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn complete_available(
        &self,
        queue: &str,
        up_to_id: i64,
        now: OffsetDateTime,
    ) -> Result<u64, RepoError> {
        let stamp = to_micros(now);
        let qb = Update::table(TABLE)
            .set("reserved_at", stamp)
            .set("completed_at", stamp)
            .filter(Condition::all([
                in_queue(queue),
                in_state(ItemState::Available),
                Condition::lte("id", up_to_id),
            ]))
            .build();
        self.execute_counted(qb).await
    }

    async fn release_item(
        &self,
        queue: &str,
        id: i64,
    ) -> Result<Option<QueueItemRecord>, RepoError> {
        let qb = Update::table(TABLE)
            .set_null("reserved_at")
            .filter(item(queue, id).and(unfinished()))
            .returning(COLUMNS)
            .build();
        self.fetch_item(qb).await
    }

    async fn release_stale(
        &self,
        queue: &str,
        reserved_before: OffsetDateTime,
    ) -> Result<u64, RepoError> {
        let qb = Update::table(TABLE)
            .set_null("reserved_at")
            .filter(Condition::all([
                in_queue(queue),
                Condition::is_not_null("reserved_at"),
                Condition::lt("reserved_at", to_micros(reserved_before)),
                unfinished(),
            ]))
            .build();
        self.execute_counted(qb).await
    }

    async fn record_attempt(
        &self,
        queue: &str,
        id: i64,
    ) -> Result<Option<QueueItemRecord>, RepoError> {
        let qb = Update::table(TABLE)
            .set_expr("attempts", "attempts + 1")
            .filter(item(queue, id))
            .returning(COLUMNS)
            .build();
        self.fetch_item(qb).await
    }

    async fn flag_exhausted(
        &self,
        queue: &str,
        threshold: i32,
        batch_size: u32,
        now: OffsetDateTime,
    ) -> Result<u64, RepoError> {
        if batch_size == 0 {
            return Ok(0);
        }
        let exhausted = oldest_first(
            Select::from(TABLE).columns(&["id"]).filter(Condition::all([
                in_queue(queue),
                Condition::gte("attempts", threshold),
                in_state(ItemState::Available),
            ])),
        )
        .limit(batch_size.into());

        let qb = Update::table(TABLE)
            .set("failed_at", to_micros(now))
            .filter(Condition::in_select("id", exhausted))
            .build();
        self.execute_counted(qb).await
    }

    async fn delete_item(&self, queue: &str, id: i64) -> Result<bool, RepoError> {
        let qb = Delete::from(TABLE).filter(item(queue, id)).build();
        Ok(self.execute_counted(qb).await? > 0)
    }

    async fn delete_items(&self, queue: &str, ids: &[i64]) -> Result<u64, RepoError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let qb = Delete::from(TABLE)
            .filter(in_queue(queue).and(Condition::is_in("id", ids.iter().copied())))
            .build();
        self.execute_counted(qb).await
    }

    async fn delete_older_than(
        &self,
        queue: &str,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> Result<u64, RepoError> {
        if limit == 0 {
            return Ok(0);
        }
        let qb = Delete::from(TABLE)
            .filter(in_queue(queue).and(Condition::lt("created_at", to_micros(cutoff))))
            .bounded("id", "created_at", Order::Asc, limit.into())
            .build();
        self.execute_counted(qb).await
    }

    async fn clear_queue(&self, queue: &str) -> Result<u64, RepoError> {
        let qb = Delete::from(TABLE).filter(in_queue(queue)).build();
        self.execute_counted(qb).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::{Duration, macros::datetime};

    use super::*;

    const T0: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    async fn repos() -> SqliteRepositories {
        SqliteRepositories::in_memory().await.unwrap()
    }

    fn new_item(queue: &str, key: &str, offset_secs: i64) -> NewQueueItem {
        NewQueueItem {
            queue_name: queue.to_string(),
            payload: json!({ "key": key }),
            dedup_key: key.to_string(),
            parent: None,
            created_at: T0 + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn insert_unless_available_deduplicates_available_items() {
        let repos = repos().await;
        let first = repos
            .insert_unless_available(new_item("q", "post:1", 0))
            .await
            .unwrap();
        let second = repos
            .insert_unless_available(new_item("q", "post:1", 1))
            .await
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.record.id, second.record.id);
        assert_eq!(repos.count_items("q", None).await.unwrap(), 1);

        // Once reserved the key no longer blocks a new item.
        repos.reserve_item("q", first.record.id, false, T0).await.unwrap();
        let third = repos
            .insert_unless_available(new_item("q", "post:1", 2))
            .await
            .unwrap();
        assert!(third.inserted);
        assert_eq!(repos.count_items("q", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dedup_is_scoped_to_the_queue() {
        let repos = repos().await;
        repos
            .insert_unless_available(new_item("a", "url:x", 0))
            .await
            .unwrap();
        let other = repos
            .insert_unless_available(new_item("b", "url:x", 0))
            .await
            .unwrap();
        assert!(other.inserted);
    }

    #[tokio::test]
    async fn reserve_items_returns_oldest_first() {
        let repos = repos().await;
        // Inserted out of creation order on purpose.
        for (key, offset) in [("c", 30), ("a", 10), ("d", 40), ("b", 20)] {
            repos.insert_item(new_item("q", key, offset)).await.unwrap();
        }

        let reserved = repos.reserve_items("q", 2, None, false, T0).await.unwrap();
        let keys: Vec<_> = reserved.iter().map(|item| item.dedup_key.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);
        assert!(reserved.iter().all(|item| item.state() == ItemState::Reserved));

        let next = repos.reserve_items("q", 10, None, true, T0).await.unwrap();
        let keys: Vec<_> = next.iter().map(|item| item.dedup_key.as_str()).collect();
        assert_eq!(keys, ["c", "d"]);
        assert!(next.iter().all(|item| item.attempts == 1));

        assert!(repos.reserve_items("q", 10, None, false, T0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn item_mutations_are_confined_to_their_queue() {
        let repos = repos().await;
        let item = repos.insert_item(new_item("q1", "k", 0)).await.unwrap();

        assert!(repos.reserve_item("q2", item.id, false, T0).await.unwrap().is_none());
        assert!(repos.complete_item("q2", item.id, T0).await.unwrap().is_none());
        assert!(repos.release_item("q2", item.id).await.unwrap().is_none());
        assert!(repos.record_attempt("q2", item.id).await.unwrap().is_none());
        assert!(!repos.delete_item("q2", item.id).await.unwrap());

        let stored = repos.find_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.state(), ItemState::Available);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn lifecycle_counts_follow_state() {
        let repos = repos().await;
        let ids: Vec<i64> = {
            let mut ids = Vec::new();
            for offset in 0..4 {
                let item = repos
                    .insert_item(new_item("q", &format!("k{offset}"), offset))
                    .await
                    .unwrap();
                ids.push(item.id);
            }
            ids
        };

        repos.reserve_item("q", ids[0], false, T0).await.unwrap();
        let completed = repos.complete_item("q", ids[1], T0).await.unwrap().unwrap();
        assert!(completed.reserved_at.is_some(), "completion implies reservation");
        repos.record_attempt("q", ids[2]).await.unwrap();
        repos.record_attempt("q", ids[2]).await.unwrap();
        repos.record_attempt("q", ids[2]).await.unwrap();
        repos.flag_exhausted("q", 3, 100, T0).await.unwrap();

        assert_eq!(repos.count_items("q", None).await.unwrap(), 4);
        let count = |state| {
            let repos = repos.clone();
            async move { repos.count_items("q", Some(state)).await.unwrap() }
        };
        assert_eq!(count(ItemState::Available).await, 1);
        assert_eq!(count(ItemState::Reserved).await, 1);
        assert_eq!(count(ItemState::Completed).await, 1);
        assert_eq!(count(ItemState::Failed).await, 1);

        let released = repos.release_item("q", ids[0]).await.unwrap().unwrap();
        assert!(released.is_available());
        assert!(repos.release_item("q", ids[1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flag_exhausted_is_bounded_per_call() {
        let repos = repos().await;
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO queue_items (queue_name, payload, dedup_key, attempts, created_at) ",
        );
        qb.push_values(0..3000_i64, |mut row, n| {
            row.push_bind("q")
                .push_bind("{}")
                .push_bind(format!("k{n}"))
                .push_bind(3_i64)
                .push_bind(to_micros(T0) + n);
        });
        qb.build().execute(repos.pool()).await.unwrap();

        assert_eq!(repos.flag_exhausted("q", 3, 100, T0).await.unwrap(), 100);
        assert_eq!(repos.flag_exhausted("q", 3, 100, T0).await.unwrap(), 100);
        assert_eq!(
            repos.count_items("q", Some(ItemState::Failed)).await.unwrap(),
            200
        );
        assert_eq!(repos.flag_exhausted("q", 4, 100, T0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn release_stale_only_touches_old_reservations() {
        let repos = repos().await;
        let old = repos.insert_item(new_item("q", "old", 0)).await.unwrap();
        let fresh = repos.insert_item(new_item("q", "fresh", 1)).await.unwrap();
        repos.reserve_item("q", old.id, false, T0).await.unwrap();
        repos
            .reserve_item("q", fresh.id, false, T0 + Duration::minutes(20))
            .await
            .unwrap();

        let released = repos
            .release_stale("q", T0 + Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(repos.find_item(old.id).await.unwrap().unwrap().is_available());
        assert_eq!(
            repos.find_item(fresh.id).await.unwrap().unwrap().state(),
            ItemState::Reserved
        );
    }

    #[tokio::test]
    async fn children_lookup_tolerates_deleted_parent() {
        let repos = repos().await;
        let parent = repos.insert_item(new_item("objects", "post:1", 0)).await.unwrap();
        let mut child = new_item("urls", "url:https://a.test/", 1);
        child.parent = Some(ParentRef {
            queue_name: "objects".to_string(),
            id: parent.id,
        });
        let child = repos.insert_item(child).await.unwrap();

        let parent_ref = child.parent.clone().unwrap();
        let children = repos
            .list_children(&parent_ref, &ItemQuery::default())
            .await
            .unwrap();
        assert_eq!(children.len(), 1);

        assert!(repos.delete_item("objects", parent.id).await.unwrap());
        assert!(repos.find_item(parent_ref.id).await.unwrap().is_none());
        assert!(repos.find_item(child.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_items_applies_default_page_size_and_state() {
        let repos = repos().await;
        for n in 0..40 {
            repos
                .insert_item(new_item("q", &format!("k{n}"), n))
                .await
                .unwrap();
        }
        let page = repos.list_items("q", &ItemQuery::default()).await.unwrap();
        assert_eq!(page.len(), 30);
        assert_eq!(page[0].dedup_key, "k0");

        let query = ItemQuery {
            limit: Some(50),
            offset: 35,
            ..ItemQuery::default()
        };
        assert_eq!(repos.list_items("q", &query).await.unwrap().len(), 5);

        let query = ItemQuery {
            state: Some(ItemState::Reserved),
            ..ItemQuery::default()
        };
        assert!(repos.list_items("q", &query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn age_sweep_and_clear_are_per_queue() {
        let repos = repos().await;
        repos.insert_item(new_item("q", "a", 0)).await.unwrap();
        repos.insert_item(new_item("q", "b", 100)).await.unwrap();
        repos.insert_item(new_item("other", "c", 0)).await.unwrap();

        let removed = repos
            .delete_older_than("q", T0 + Duration::seconds(50), 100)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(repos.clear_queue("q").await.unwrap(), 1);
        assert_eq!(repos.count_items("other", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn complete_available_skips_reserved_items() {
        let repos = repos().await;
        let a = repos.insert_item(new_item("q", "a", 0)).await.unwrap();
        repos.insert_item(new_item("q", "b", 1)).await.unwrap();
        repos.reserve_item("q", a.id, false, T0).await.unwrap();

        let last = repos.last_item_id("q").await.unwrap().unwrap();
        assert_eq!(repos.complete_available("q", last, T0).await.unwrap(), 1);
        assert_eq!(
            repos.count_items("q", Some(ItemState::Reserved)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn complete_available_stops_at_the_cutoff_id() {
        let repos = repos().await;
        assert_eq!(repos.last_item_id("q").await.unwrap(), None);

        repos.insert_item(new_item("q", "before", 0)).await.unwrap();
        let cutoff = repos.last_item_id("q").await.unwrap().unwrap();
        // Enqueued after the cutoff was taken, with an older timestamp.
        let later = repos.insert_item(new_item("q", "after", -10)).await.unwrap();

        assert_eq!(repos.complete_available("q", cutoff, T0).await.unwrap(), 1);
        let later = repos.find_item(later.id).await.unwrap().unwrap();
        assert_eq!(later.state(), ItemState::Available);
    }

    #[tokio::test]
    async fn reserve_items_skips_exhausted_items_when_asked() {
        let repos = repos().await;
        let spent = repos.insert_item(new_item("q", "spent", 0)).await.unwrap();
        let fresh = repos.insert_item(new_item("q", "fresh", 1)).await.unwrap();
        for _ in 0..3 {
            repos.record_attempt("q", spent.id).await.unwrap();
        }

        let reserved = repos.reserve_items("q", 10, Some(3), false, T0).await.unwrap();
        let ids: Vec<i64> = reserved.iter().map(|item| item.id).collect();
        assert_eq!(ids, [fresh.id]);

        let reserved = repos.reserve_items("q", 10, None, false, T0).await.unwrap();
        let ids: Vec<i64> = reserved.iter().map(|item| item.id).collect();
        assert_eq!(ids, [spent.id]);
    }

    #[tokio::test]
    async fn age_sweep_is_bounded_per_call() {
        let repos = repos().await;
        for n in 0..5 {
            repos
                .insert_item(new_item("q", &format!("k{n}"), n))
                .await
                .unwrap();
        }
        let newest = repos.insert_item(new_item("q", "new", 100)).await.unwrap();
        let cutoff = T0 + Duration::seconds(50);

        assert_eq!(repos.delete_older_than("q", cutoff, 2).await.unwrap(), 2);
        assert_eq!(repos.delete_older_than("q", cutoff, 2).await.unwrap(), 2);
        assert_eq!(repos.delete_older_than("q", cutoff, 2).await.unwrap(), 1);
        assert_eq!(repos.delete_older_than("q", cutoff, 2).await.unwrap(), 0);
        assert_eq!(repos.delete_older_than("q", cutoff, 0).await.unwrap(), 0);
        assert!(repos.find_item(newest.id).await.unwrap().is_some());
    }
}
