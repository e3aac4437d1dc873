use async_trait::async_trait;
use sqlx::QueryBuilder;

use crate::{
    application::repos::{ArchiveScope, ContentRepo, ContentWriteRepo, RepoError, UpsertPostParams},
    domain::{
        entities::{PostRecord, TermRecord},
        types::PostStatus,
    },
};

use super::{
    SqliteRepositories,
    query::{Condition, Delete, Select},
    util::{convert_count, from_micros_opt, map_sqlx_error, to_micros},
};

#[derive(sqlx::FromRow)]
struct PostRow {
    id: i64,
    slug: String,
    post_type: String,
    status: String,
    author_slug: Option<String>,
    published_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct TermRow {
    id: i64,
    taxonomy: String,
    slug: String,
}

impl From<TermRow> for TermRecord {
    fn from(row: TermRow) -> Self {
        Self {
            id: row.id,
            taxonomy: row.taxonomy,
            slug: row.slug,
        }
    }
}

fn published() -> Condition {
    Condition::all([
        Condition::eq("status", PostStatus::Publish.as_str()),
        Condition::is_not_null("published_at"),
    ])
}

fn scope_condition(scope: &ArchiveScope) -> Result<Condition, RepoError> {
    let condition = match scope {
        ArchiveScope::Home { post_types } => {
            Condition::is_in("post_type", post_types.iter().map(String::as_str))
        }
        ArchiveScope::PostType(post_type) => Condition::eq("post_type", post_type),
        ArchiveScope::Term(term_id) => Condition::in_select(
            "id",
            Select::from("post_terms")
                .columns(&["post_id"])
                .filter(Condition::eq("term_id", *term_id)),
        ),
        ArchiveScope::Author(slug) => Condition::in_select(
            "author_id",
            Select::from("authors")
                .columns(&["id"])
                .filter(Condition::eq("slug", slug)),
        ),
        ArchiveScope::Date(archive) => {
            let (start, end) = archive.bounds().map_err(|err| RepoError::InvalidInput {
                message: err.to_string(),
            })?;
            Condition::all([
                Condition::gte("published_at", to_micros(start)),
                Condition::lt("published_at", to_micros(end)),
            ])
        }
    };
    Ok(condition)
}

#[async_trait]
impl ContentRepo for SqliteRepositories {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT p.id, p.slug, p.post_type, p.status, a.slug AS author_slug, p.published_at
            FROM posts p
            LEFT JOIN authors a ON a.id = p.author_id
            WHERE p.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let terms = sqlx::query_as::<_, TermRow>(
            r#"
            SELECT t.id, t.taxonomy, t.slug
            FROM terms t
            INNER JOIN post_terms pt ON pt.term_id = t.id
            WHERE pt.post_id = ?
            ORDER BY t.taxonomy, t.slug
            "#,
        )
        .bind(id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let status = PostStatus::try_from(row.status.as_str()).map_err(|err| {
            RepoError::Integrity {
                message: format!("post {}: {err}", row.id),
            }
        })?;

        Ok(Some(PostRecord {
            id: row.id,
            slug: row.slug,
            post_type: row.post_type,
            status,
            author_slug: row.author_slug,
            published_at: from_micros_opt(row.published_at)?,
            terms: terms.into_iter().map(TermRecord::from).collect(),
        }))
    }

    async fn find_term(&self, id: i64) -> Result<Option<TermRecord>, RepoError> {
        let row = sqlx::query_as::<_, TermRow>("SELECT id, taxonomy, slug FROM terms WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(TermRecord::from))
    }

    async fn count_published(&self, scope: &ArchiveScope) -> Result<u64, RepoError> {
        let filter = published().and(scope_condition(scope)?);
        let mut qb = Select::count("posts").filter(filter).build();
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        convert_count(count)
    }
}

#[async_trait]
impl ContentWriteRepo for SqliteRepositories {
    async fn upsert_author(&self, id: i64, slug: &str) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO authors (id, slug) VALUES (?, ?) \
             ON CONFLICT (id) DO UPDATE SET slug = excluded.slug",
        )
        .bind(id)
        .bind(slug)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn upsert_term(&self, term: &TermRecord) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO terms (id, taxonomy, slug) VALUES (?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET taxonomy = excluded.taxonomy, slug = excluded.slug",
        )
        .bind(term.id)
        .bind(&term.taxonomy)
        .bind(&term.slug)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn upsert_post(&self, params: &UpsertPostParams) -> Result<(), RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, slug, post_type, status, author_id, published_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                slug = excluded.slug,
                post_type = excluded.post_type,
                status = excluded.status,
                author_id = excluded.author_id,
                published_at = excluded.published_at
            "#,
        )
        .bind(params.id)
        .bind(&params.slug)
        .bind(&params.post_type)
        .bind(params.status.as_str())
        .bind(params.author_id)
        .bind(params.published_at.map(to_micros))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM post_terms WHERE post_id = ?")
            .bind(params.id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if !params.term_ids.is_empty() {
            let mut qb = QueryBuilder::new("INSERT INTO post_terms (post_id, term_id) ");
            qb.push_values(&params.term_ids, |mut row, term_id| {
                row.push_bind(params.id).push_bind(*term_id);
            });
            qb.push(" ON CONFLICT DO NOTHING");
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn delete_post(&self, id: i64) -> Result<bool, RepoError> {
        let mut qb = Delete::from("posts")
            .filter(Condition::eq("id", id))
            .build();
        let result = qb
            .build()
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_term(&self, id: i64) -> Result<bool, RepoError> {
        let mut qb = Delete::from("terms")
            .filter(Condition::eq("id", id))
            .build();
        let result = qb
            .build()
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }
}
