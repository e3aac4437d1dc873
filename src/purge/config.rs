//! Purge pipeline throttles.
//!
//! Every knob the consumer and dispatcher honour is carried here and handed
//! over at construction time.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::queue::{DEFAULT_FLAG_BATCH, DEFAULT_MAX_ATTEMPTS};

const DEFAULT_OBJECT_BATCH_SIZE: u32 = 100;
const DEFAULT_URL_BATCH_SIZE: u32 = 500;
const DEFAULT_RESERVATION_TIMEOUT_SECS: i64 = 15 * 60;
const DEFAULT_RETENTION_DAYS: i64 = 7;
const DEFAULT_TICK_SCHEDULE: &str = "0 * * * * *";
const DEFAULT_CLEANUP_SCHEDULE: &str = "0 0 3 * * Sun";

/// How a purge request is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeMode {
    /// Queue the reference; the periodic consumer resolves and dispatches it.
    #[default]
    Deferred,
    /// Resolve and dispatch synchronously, bypassing both queues.
    Immediate,
}

impl PurgeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PurgeMode::Deferred => "deferred",
            PurgeMode::Immediate => "immediate",
        }
    }
}

impl FromStr for PurgeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "deferred" => Ok(PurgeMode::Deferred),
            "immediate" => Ok(PurgeMode::Immediate),
            other => Err(format!("unknown purge mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeConfig {
    pub mode: PurgeMode,
    /// Object-queue items resolved per tick.
    pub object_batch_size: u32,
    /// URL-queue items reserved per drain round.
    pub url_batch_size: u32,
    /// URL-queue items drained per tick; `None` drains everything available.
    pub drain_limit: Option<u32>,
    /// Upper bound on the chunk size, below the driver's own limit.
    pub batch_size_cap: Option<usize>,
    /// Attempts after which an item is flagged failed.
    pub max_attempts: i32,
    /// Items flagged failed per queue per tick.
    pub flag_batch_size: u32,
    /// Reservations older than this are released at the start of a tick.
    pub reservation_timeout: Duration,
    /// Items older than this are deleted by the cleanup job.
    pub retention: Duration,
    /// Six-field cron expression for the consumer tick.
    pub tick_schedule: String,
    /// Six-field cron expression for the cleanup sweep.
    pub cleanup_schedule: String,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            mode: PurgeMode::Deferred,
            object_batch_size: DEFAULT_OBJECT_BATCH_SIZE,
            url_batch_size: DEFAULT_URL_BATCH_SIZE,
            drain_limit: None,
            batch_size_cap: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            flag_batch_size: DEFAULT_FLAG_BATCH,
            reservation_timeout: Duration::seconds(DEFAULT_RESERVATION_TIMEOUT_SECS),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            tick_schedule: DEFAULT_TICK_SCHEDULE.to_string(),
            cleanup_schedule: DEFAULT_CLEANUP_SCHEDULE.to_string(),
        }
    }
}

impl From<&crate::config::PurgeSettings> for PurgeConfig {
    fn from(settings: &crate::config::PurgeSettings) -> Self {
        Self {
            mode: settings.mode,
            object_batch_size: settings.object_batch_size.get(),
            url_batch_size: settings.url_batch_size.get(),
            drain_limit: settings.drain_limit,
            batch_size_cap: settings.batch_size_cap.map(|cap| cap.get()),
            max_attempts: settings.max_attempts,
            flag_batch_size: settings.flag_batch_size.get(),
            reservation_timeout: Duration::seconds(settings.reservation_timeout_secs),
            retention: Duration::days(settings.retention_days),
            tick_schedule: settings.tick_schedule.clone(),
            cleanup_schedule: settings.cleanup_schedule.clone(),
        }
    }
}

impl PurgeConfig {
    /// Size of the next drain round given what is left of the tick's budget.
    pub fn next_drain_round(&self, drained: u32) -> u32 {
        match self.drain_limit {
            Some(limit) => limit.saturating_sub(drained).min(self.url_batch_size),
            None => self.url_batch_size,
        }
    }
}
