use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    application::repos::{ItemQuery, UpsertPostParams},
    domain::{
        entities::TermRecord,
        references::ContentReference,
        types::{ItemState, PostStatus},
    },
    purge::{QueueKind, TriggerOutcome},
};

use super::AdminState;
use super::error::ApiError;

const MAX_ITEM_PAGE: u32 = 500;

fn queue_kind(raw: &str) -> Result<QueueKind, ApiError> {
    raw.parse().map_err(|_| ApiError::unknown_queue(raw))
}

pub(super) async fn health(State(state): State<AdminState>) -> Response {
    match state.db.health_check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            super::error::codes::REPO,
            "Database unavailable",
            Some(err.to_string()),
        )
        .into_response(),
    }
}

pub(super) async fn queue_stats(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = queue_kind(&queue)?;
    let stats = state.pipeline.stats(kind).await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub(super) struct ItemListQuery {
    pub state: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub(super) async fn list_items(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
    Query(query): Query<ItemListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = queue_kind(&queue)?;
    let item_state = query
        .state
        .as_deref()
        .map(ItemState::try_from)
        .transpose()?;

    let query = ItemQuery {
        state: item_state,
        limit: query.limit.map(|limit| limit.clamp(1, MAX_ITEM_PAGE)),
        offset: query.offset.unwrap_or(0),
    };
    let items = state.pipeline.list_items(kind, &query).await?;
    Ok(Json(items))
}

#[derive(Debug, Serialize)]
pub(super) struct Deleted {
    pub deleted: u64,
}

pub(super) async fn clear_items(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = queue_kind(&queue)?;
    let deleted = state.pipeline.clear(kind).await?;
    Ok(Json(Deleted { deleted }))
}

#[derive(Debug, Deserialize)]
pub(super) struct DeleteItemsBody {
    pub ids: Vec<i64>,
}

pub(super) async fn delete_items(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
    Json(body): Json<DeleteItemsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = queue_kind(&queue)?;
    if body.ids.is_empty() {
        return Err(ApiError::bad_request(
            "No items to delete",
            Some("`ids` must list at least one item id".to_string()),
        ));
    }
    let deleted = state.pipeline.delete_items(kind, &body.ids).await?;
    Ok(Json(Deleted { deleted }))
}

pub(super) async fn delete_item(
    State(state): State<AdminState>,
    Path((queue, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = queue_kind(&queue)?;
    if state.pipeline.delete_item(kind, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Queue item not found"))
    }
}

/// `{"type": "post", "id": 42}`; `id` may be a number or a string and is
/// omitted for `all`.
#[derive(Debug, Deserialize)]
pub(super) struct PurgeRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Option<Value>,
}

impl PurgeRequest {
    fn reference(&self) -> Result<ContentReference, ApiError> {
        let id = match &self.id {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => Some(value.clone()),
            Some(Value::Number(value)) => Some(value.to_string()),
            Some(other) => {
                return Err(ApiError::bad_request(
                    "Invalid purge request",
                    Some(format!("`id` must be a string or a number, got {other}")),
                ));
            }
        };
        Ok(ContentReference::parse(&self.kind, id.as_deref())?)
    }
}

pub(super) async fn purge(
    State(state): State<AdminState>,
    Json(request): Json<PurgeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reference = request.reference()?;
    let outcome = state.pipeline.trigger().trigger(reference).await?;
    let status = match outcome {
        TriggerOutcome::Queued { .. } => StatusCode::ACCEPTED,
        TriggerOutcome::Dispatched { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthorBody {
    pub slug: String,
}

pub(super) async fn put_author(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(body): Json<AuthorBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.content.upsert_author(id, body.slug.trim()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct TermBody {
    pub taxonomy: String,
    pub slug: String,
}

pub(super) async fn put_term(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(body): Json<TermBody>,
) -> Result<impl IntoResponse, ApiError> {
    let term = TermRecord {
        id,
        taxonomy: body.taxonomy.trim().to_string(),
        slug: body.slug.trim().to_string(),
    };
    state.content.upsert_term(&term).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub(super) struct PostBody {
    pub slug: String,
    #[serde(default = "default_post_type")]
    pub post_type: String,
    pub status: PostStatus,
    pub author_id: Option<i64>,
    /// RFC 3339.
    pub published_at: Option<String>,
    #[serde(default)]
    pub term_ids: Vec<i64>,
}

fn default_post_type() -> String {
    "post".to_string()
}

pub(super) async fn put_post(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(body): Json<PostBody>,
) -> Result<impl IntoResponse, ApiError> {
    let published_at = body
        .published_at
        .as_deref()
        .map(|value| OffsetDateTime::parse(value, &Rfc3339))
        .transpose()
        .map_err(|err| {
            ApiError::bad_request("Invalid published_at", Some(err.to_string()))
        })?;

    let params = UpsertPostParams {
        id,
        slug: body.slug.trim().to_string(),
        post_type: body.post_type,
        status: body.status,
        author_id: body.author_id,
        published_at,
        term_ids: body.term_ids,
    };
    state.content.upsert_post(&params).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn delete_post(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.content.delete_post(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Post not found"))
    }
}

pub(super) async fn delete_term(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.content.delete_term(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Term not found"))
    }
}
