use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use edgepurge::{
    application::{
        pipeline::Pipeline,
        repos::{ContentRepo, ContentWriteRepo, QueueRepo},
    },
    infra::{
        db::SqliteRepositories,
        http::{AdminState, build_admin_router},
    },
    purge::{
        DriverDescriptor, DriverError, PurgeConfig, PurgeDriver, PurgeMode, ResolverConfig,
    },
};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;

struct CollectingDriver {
    descriptor: DriverDescriptor,
    urls: Mutex<Vec<String>>,
}

impl CollectingDriver {
    fn new() -> Self {
        Self {
            descriptor: DriverDescriptor {
                name: "collecting",
                max_urls_per_batch: 30,
                purge_all_prefixes: Vec::new(),
            },
            urls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PurgeDriver for CollectingDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    async fn purge_by_urls(&self, urls: &[String]) -> Result<(), DriverError> {
        self.urls.lock().unwrap().extend_from_slice(urls);
        Ok(())
    }

    async fn purge_by_tags(&self, _tags: &[String]) -> Result<(), DriverError> {
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

async fn admin(mode: PurgeMode, driver: Option<Arc<dyn PurgeDriver>>) -> Router {
    let repos = Arc::new(SqliteRepositories::in_memory().await.unwrap());
    let queues: Arc<dyn QueueRepo> = repos.clone();
    let content: Arc<dyn ContentRepo> = repos.clone();
    let pipeline = Pipeline::new(
        "site",
        queues,
        content,
        ResolverConfig::new(Url::parse("https://blog.test/").unwrap()),
        PurgeConfig {
            mode,
            ..PurgeConfig::default()
        },
        driver,
    );
    let writer: Arc<dyn ContentWriteRepo> = repos.clone();
    build_admin_router(AdminState {
        db: repos,
        pipeline: Arc::new(pipeline),
        content: writer,
    })
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_no_content() {
    let router = admin(PurgeMode::Deferred, None).await;
    let (status, _) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn unknown_queue_uses_the_error_envelope() {
    let router = admin(PurgeMode::Deferred, None).await;
    let (status, body) = send(&router, "GET", "/queues/jobs/stats", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "unknown_queue");
}

#[tokio::test]
async fn purge_without_a_driver_is_unavailable() {
    let router = admin(PurgeMode::Deferred, None).await;
    let (status, body) = send(
        &router,
        "POST",
        "/purge",
        Some(json!({ "type": "post", "id": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "not_configured");
}

#[tokio::test]
async fn deferred_purge_is_queued_and_inspectable() {
    let driver: Arc<dyn PurgeDriver> = Arc::new(CollectingDriver::new());
    let router = admin(PurgeMode::Deferred, Some(driver)).await;

    let (status, body) = send(
        &router,
        "POST",
        "/purge",
        Some(json!({ "type": "post", "id": "7" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"], "queued");
    assert_eq!(body["inserted"], true);

    let (_, again) = send(
        &router,
        "POST",
        "/purge",
        Some(json!({ "type": "post", "id": 7 })),
    )
    .await;
    assert_eq!(again["inserted"], false);
    assert_eq!(again["item_id"], body["item_id"]);

    let (status, stats) = send(&router, "GET", "/queues/objects/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["name"], "site_purge_objects");
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["available"], 1);

    let (status, items) = send(&router, "GET", "/queues/objects/items?state=available", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(items.as_array().unwrap().len(), 1);

    let uri = format!("/queues/objects/items/{}", body["item_id"]);
    let (status, _) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn bulk_delete_is_separate_from_clear() {
    let driver: Arc<dyn PurgeDriver> = Arc::new(CollectingDriver::new());
    let router = admin(PurgeMode::Deferred, Some(driver)).await;

    let mut ids = Vec::new();
    for id in 1..=3 {
        let (status, body) = send(
            &router,
            "POST",
            "/purge",
            Some(json!({ "type": "term", "id": id })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        ids.push(body["item_id"].clone());
    }

    let (status, body) = send(
        &router,
        "POST",
        "/queues/objects/items/delete",
        Some(json!({ "ids": [ids[0], ids[2]] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);

    let (_, items) = send(&router, "GET", "/queues/objects/items", None).await;
    let remaining: Vec<&Value> = items
        .as_array()
        .unwrap()
        .iter()
        .map(|item| &item["id"])
        .collect();
    assert_eq!(remaining, [&ids[1]]);

    let (status, body) = send(
        &router,
        "POST",
        "/queues/urls/items/delete",
        Some(json!({ "ids": [ids[1]] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 0);

    let (status, body) = send(
        &router,
        "POST",
        "/queues/objects/items/delete",
        Some(json!({ "ids": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = send(&router, "DELETE", "/queues/objects/items", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
}

#[tokio::test]
async fn immediate_purge_dispatches_right_away() {
    let driver = Arc::new(CollectingDriver::new());
    let router = admin(PurgeMode::Immediate, Some(driver.clone() as Arc<dyn PurgeDriver>)).await;

    let (status, body) = send(
        &router,
        "POST",
        "/purge",
        Some(json!({ "type": "url", "id": "https://blog.test/hello/" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "dispatched");
    assert_eq!(
        *driver.urls.lock().unwrap(),
        vec!["https://blog.test/hello/".to_string()]
    );
}

#[tokio::test]
async fn invalid_purge_requests_are_bad_requests() {
    let router = admin(PurgeMode::Deferred, None).await;
    let (status, body) = send(
        &router,
        "POST",
        "/purge",
        Some(json!({ "type": "post", "id": "abc" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["code"].is_string());

    let (status, _) = send(
        &router,
        "POST",
        "/purge",
        Some(json!({ "type": "post", "id": [1] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn content_mirror_accepts_upserts_and_deletes() {
    let router = admin(PurgeMode::Deferred, None).await;

    let (status, _) = send(
        &router,
        "PUT",
        "/content/authors/3",
        Some(json!({ "slug": "ada" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &router,
        "PUT",
        "/content/terms/5",
        Some(json!({ "taxonomy": "category", "slug": "news" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &router,
        "PUT",
        "/content/posts/9",
        Some(json!({
            "slug": "hello-world",
            "status": "publish",
            "author_id": 3,
            "published_at": "2024-03-05T10:00:00Z",
            "term_ids": [5]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &router,
        "PUT",
        "/content/posts/10",
        Some(json!({ "slug": "x", "status": "publish", "published_at": "yesterday" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, "DELETE", "/content/posts/9", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, "DELETE", "/content/posts/9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, "DELETE", "/content/terms/5", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}
