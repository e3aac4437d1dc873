//! Admin HTTP surface: queue inspection, purge requests and content mirror sync.

mod error;
mod handlers;
mod middleware;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, ErrorReport, codes};

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post, put},
};

use crate::{
    application::{pipeline::Pipeline, repos::ContentWriteRepo},
    infra::db::SqliteRepositories,
};

#[derive(Clone)]
pub struct AdminState {
    pub db: Arc<SqliteRepositories>,
    pub pipeline: Arc<Pipeline>,
    pub content: Arc<dyn ContentWriteRepo>,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/queues/{queue}/stats", get(handlers::queue_stats))
        .route(
            "/queues/{queue}/items",
            get(handlers::list_items).delete(handlers::clear_items),
        )
        .route("/queues/{queue}/items/delete", post(handlers::delete_items))
        .route("/queues/{queue}/items/{id}", delete(handlers::delete_item))
        .route("/purge", post(handlers::purge))
        .route("/content/authors/{id}", put(handlers::put_author))
        .route(
            "/content/terms/{id}",
            put(handlers::put_term).delete(handlers::delete_term),
        )
        .route(
            "/content/posts/{id}",
            put(handlers::put_post).delete(handlers::delete_post),
        )
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
