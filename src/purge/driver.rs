//! Contract between the dispatcher and an upstream purge API.

use async_trait::async_trait;
use thiserror::Error;

/// Static description of a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescriptor {
    pub name: &'static str,
    /// Largest batch `purge_by_urls`/`purge_by_tags` accept.
    pub max_urls_per_batch: usize,
    /// Prefixes purged in place of a native "purge everything".
    pub purge_all_prefixes: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("batch of {size} exceeds the driver limit of {max}")]
    BatchTooLarge { size: usize, max: usize },
    #[error("purge request failed: {0}")]
    Transport(String),
    #[error("upstream rejected the purge (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected upstream response: {0}")]
    Response(String),
    #[error("driver is misconfigured: {0}")]
    Misconfigured(String),
}

impl DriverError {
    /// Reject oversized batches before any network call.
    pub fn check_batch(size: usize, max: usize) -> Result<(), DriverError> {
        if size > max {
            Err(DriverError::BatchTooLarge { size, max })
        } else {
            Ok(())
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DriverError::Response(err.to_string())
        } else {
            DriverError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait PurgeDriver: Send + Sync {
    fn descriptor(&self) -> &DriverDescriptor;

    fn max_urls_per_batch(&self) -> usize {
        self.descriptor().max_urls_per_batch
    }

    async fn purge_by_url(&self, url: &str) -> Result<(), DriverError> {
        self.purge_by_urls(&[url.to_string()]).await
    }

    /// Purge at most [`max_urls_per_batch`](Self::max_urls_per_batch) URLs.
    async fn purge_by_urls(&self, urls: &[String]) -> Result<(), DriverError>;

    /// Purge at most [`max_urls_per_batch`](Self::max_urls_per_batch) cache tags.
    async fn purge_by_tags(&self, tags: &[String]) -> Result<(), DriverError>;

    async fn purge_all(&self) -> Result<(), DriverError>;
}
