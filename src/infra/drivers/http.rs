//! Generic purge webhook.
//!
//! Receives `{"urls": [...]}`, `{"tags": [...]}` or `{"prefixes": [...]}` as a
//! JSON POST. There is no native purge-everything; `purge_all` purges the
//! configured prefixes instead.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{Value, json};

use crate::purge::{DriverDescriptor, DriverError, PurgeDriver};

pub const NAME: &str = "http";
pub const MAX_URLS_PER_BATCH: usize = 500;

pub struct HttpDriver {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    descriptor: DriverDescriptor,
}

impl HttpDriver {
    pub fn new(
        endpoint: Url,
        token: Option<String>,
        purge_all_prefixes: Vec<String>,
        max_urls_per_batch: Option<usize>,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DriverError::Misconfigured(format!(
                    "unsupported endpoint scheme `{other}`"
                )));
            }
        }
        let client = Client::builder()
            .user_agent(concat!("edgepurge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token,
            descriptor: DriverDescriptor {
                name: NAME,
                max_urls_per_batch: max_urls_per_batch
                    .unwrap_or(MAX_URLS_PER_BATCH)
                    .clamp(1, MAX_URLS_PER_BATCH),
                purge_all_prefixes,
            },
        })
    }

    async fn send(&self, body: Value) -> Result<(), DriverError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(DriverError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PurgeDriver for HttpDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    async fn purge_by_urls(&self, urls: &[String]) -> Result<(), DriverError> {
        DriverError::check_batch(urls.len(), self.max_urls_per_batch())?;
        if urls.is_empty() {
            return Ok(());
        }
        self.send(json!({ "urls": urls })).await
    }

    async fn purge_by_tags(&self, tags: &[String]) -> Result<(), DriverError> {
        DriverError::check_batch(tags.len(), self.max_urls_per_batch())?;
        if tags.is_empty() {
            return Ok(());
        }
        self.send(json!({ "tags": tags })).await
    }

    async fn purge_all(&self) -> Result<(), DriverError> {
        let prefixes = &self.descriptor.purge_all_prefixes;
        if prefixes.is_empty() {
            return Err(DriverError::Misconfigured(
                "purge-all needs at least one purge_all_prefixes entry".to_string(),
            ));
        }
        for chunk in prefixes.chunks(self.max_urls_per_batch()) {
            self.send(json!({ "prefixes": chunk })).await?;
        }
        Ok(())
    }
}
