//! Entry point for purge requests.
//!
//! Callers report what changed; the trigger either queues the reference or,
//! in immediate mode, resolves and dispatches it synchronously.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::references::ContentReference;

use super::{
    PurgeError, config::PurgeMode, dispatcher::Dispatcher, object_queue::ObjectQueue,
    resolver::Resolver,
};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Queued {
        item_id: i64,
        /// `false` when the reference was already waiting.
        inserted: bool,
    },
    Dispatched {
        targets: usize,
        chunks_sent: usize,
        purged_all: bool,
    },
}

pub struct PurgeTrigger {
    mode: PurgeMode,
    objects: ObjectQueue,
    resolver: Arc<Resolver>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl PurgeTrigger {
    pub fn new(
        mode: PurgeMode,
        objects: ObjectQueue,
        resolver: Arc<Resolver>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Self {
        Self {
            mode,
            objects,
            resolver,
            dispatcher,
        }
    }

    pub fn mode(&self) -> PurgeMode {
        self.mode
    }

    pub fn is_configured(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Purge `reference` using the configured mode.
    pub async fn trigger(&self, reference: ContentReference) -> Result<TriggerOutcome, PurgeError> {
        self.trigger_with(reference, self.mode).await
    }

    /// Purge `reference` using an explicit mode.
    ///
    /// Refuses with [`PurgeError::NotConfigured`] before touching any queue
    /// when no driver is available.
    pub async fn trigger_with(
        &self,
        reference: ContentReference,
        mode: PurgeMode,
    ) -> Result<TriggerOutcome, PurgeError> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| PurgeError::NotConfigured("no purge driver configured".to_string()))?;

        match mode {
            PurgeMode::Deferred => {
                let enqueued = self.objects.add(&reference).await?;
                debug!(
                    reference = %reference,
                    item_id = enqueued.item.id,
                    inserted = enqueued.inserted,
                    "purge request queued"
                );
                Ok(TriggerOutcome::Queued {
                    item_id: enqueued.item.id,
                    inserted: enqueued.inserted,
                })
            }
            PurgeMode::Immediate => {
                let targets = self.resolver.resolve(&reference).await?;
                let mut report = dispatcher.dispatch(&targets).await;
                if let Some(err) = report.error.take() {
                    return Err(err.into());
                }
                info!(
                    reference = %reference,
                    targets = targets.len(),
                    chunks_sent = report.chunks_sent,
                    "purge dispatched immediately"
                );
                Ok(TriggerOutcome::Dispatched {
                    targets: targets.len(),
                    chunks_sent: report.chunks_sent,
                    purged_all: report.purged_all,
                })
            }
        }
    }

    pub async fn purge_post(&self, id: i64) -> Result<TriggerOutcome, PurgeError> {
        self.trigger(ContentReference::Post(id)).await
    }

    pub async fn purge_term(&self, id: i64) -> Result<TriggerOutcome, PurgeError> {
        self.trigger(ContentReference::Term(id)).await
    }

    pub async fn purge_url(&self, url: impl Into<String>) -> Result<TriggerOutcome, PurgeError> {
        self.trigger(ContentReference::Url(url.into())).await
    }

    pub async fn purge_cache_tag(
        &self,
        tag: impl Into<String>,
    ) -> Result<TriggerOutcome, PurgeError> {
        self.trigger(ContentReference::CacheTag(tag.into())).await
    }

    pub async fn purge_all(&self) -> Result<TriggerOutcome, PurgeError> {
        self.trigger(ContentReference::All).await
    }
}
