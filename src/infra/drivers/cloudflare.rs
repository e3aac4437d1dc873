//! Cloudflare zone purge API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::purge::{DriverDescriptor, DriverError, PurgeDriver};

pub const NAME: &str = "cloudflare";
pub const MAX_URLS_PER_BATCH: usize = 30;
pub const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudflareAuth {
    /// Scoped API token, sent as a bearer token.
    Token(String),
    /// Global API key with the account email.
    Key { email: String, key: String },
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

impl Envelope {
    fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "request unsuccessful".to_string();
        }
        self.errors
            .iter()
            .map(|err| format!("{}: {}", err.code, err.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct CloudflareDriver {
    client: Client,
    endpoint: Url,
    auth: CloudflareAuth,
    descriptor: DriverDescriptor,
}

impl CloudflareDriver {
    pub fn new(
        api_base: &Url,
        zone_id: &str,
        auth: CloudflareAuth,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let endpoint = purge_endpoint(api_base, zone_id)?;
        let client = Client::builder()
            .user_agent(concat!("edgepurge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            auth,
            descriptor: DriverDescriptor {
                name: NAME,
                max_urls_per_batch: MAX_URLS_PER_BATCH,
                purge_all_prefixes: Vec::new(),
            },
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, body: Value) -> Result<(), DriverError> {
        let request = self.client.post(self.endpoint.clone()).json(&body);
        let request = match &self.auth {
            CloudflareAuth::Token(token) => request.bearer_auth(token),
            CloudflareAuth::Key { email, key } => request
                .header("X-Auth-Email", email)
                .header("X-Auth-Key", key),
        };

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(DriverError::Rejected {
                    status: status.as_u16(),
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                });
            }
            Err(err) => return Err(DriverError::Response(err.to_string())),
        };

        if status.is_success() && envelope.success {
            Ok(())
        } else {
            Err(DriverError::Rejected {
                status: status.as_u16(),
                message: envelope.error_summary(),
            })
        }
    }
}

fn purge_endpoint(api_base: &Url, zone_id: &str) -> Result<Url, DriverError> {
    let zone_id = zone_id.trim();
    if zone_id.is_empty() || zone_id.contains('/') {
        return Err(DriverError::Misconfigured(format!(
            "invalid zone id `{zone_id}`"
        )));
    }

    let mut base = api_base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("zones/{zone_id}/purge_cache"))
        .map_err(|err| DriverError::Misconfigured(err.to_string()))
}

#[async_trait]
impl PurgeDriver for CloudflareDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    async fn purge_by_urls(&self, urls: &[String]) -> Result<(), DriverError> {
        DriverError::check_batch(urls.len(), self.max_urls_per_batch())?;
        if urls.is_empty() {
            return Ok(());
        }
        self.send(json!({ "files": urls })).await
    }

    async fn purge_by_tags(&self, tags: &[String]) -> Result<(), DriverError> {
        DriverError::check_batch(tags.len(), self.max_urls_per_batch())?;
        if tags.is_empty() {
            return Ok(());
        }
        self.send(json!({ "tags": tags })).await
    }

    async fn purge_all(&self) -> Result<(), DriverError> {
        self.send(json!({ "purge_everything": true })).await
    }
}
