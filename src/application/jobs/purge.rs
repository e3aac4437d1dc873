//! Cron-triggered consumer tick and retention sweep.

use std::sync::Arc;

use apalis::prelude::*;
use tracing::{info, warn};

use crate::application::pipeline::Pipeline;
use crate::purge::PurgeError;

/// Marker for the consumer tick; apalis-cron builds one per firing.
#[derive(Default, Debug, Clone)]
pub struct PurgeTickJob;

impl From<chrono::DateTime<chrono::Utc>> for PurgeTickJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

/// Marker for the retention sweep.
#[derive(Default, Debug, Clone)]
pub struct PurgeCleanupJob;

impl From<chrono::DateTime<chrono::Utc>> for PurgeCleanupJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Clone)]
pub struct PurgeJobContext {
    pub pipeline: Arc<Pipeline>,
}

/// A failing tick is logged and left for the next firing; the items it
/// touched carry their own retry state.
pub async fn process_purge_tick_job(
    _job: PurgeTickJob,
    ctx: Data<PurgeJobContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.pipeline.consumer().tick().await {
        Ok(report) if report.dispatch_error.is_some() => {
            warn!(
                tick_id = %report.tick_id,
                error = report.dispatch_error.as_deref().unwrap_or_default(),
                retried = report.retried,
                "purge tick ended early"
            );
        }
        Ok(_) => {}
        Err(PurgeError::NotConfigured(reason)) => {
            warn!(reason = %reason, "purge tick skipped");
        }
        Err(err) => {
            warn!(error = %err, "purge tick failed");
        }
    }
    Ok(())
}

pub async fn process_purge_cleanup_job(
    _job: PurgeCleanupJob,
    ctx: Data<PurgeJobContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.pipeline.consumer().cleanup().await {
        Ok(report) if report.objects_deleted + report.urls_deleted > 0 => {
            info!(
                objects_deleted = report.objects_deleted,
                urls_deleted = report.urls_deleted,
                "Removed expired purge items"
            );
        }
        Ok(_) => {}
        Err(err) => {
            warn!(error = %err, "Failed to remove expired purge items");
        }
    }
    Ok(())
}
