//! Cache purge pipeline.
//!
//! Content changes enter as [`ContentReference`](crate::domain::references::ContentReference)s:
//!
//! - **Deferred**: the [`PurgeTrigger`] enqueues the reference on the
//!   [`ObjectQueue`]. The [`PurgeConsumer`] tick resolves waiting references
//!   into the [`UrlQueue`] and drains it through the [`Dispatcher`].
//! - **Immediate**: the trigger resolves and dispatches on the spot.
//!
//! ## Configuration
//!
//! ```toml
//! [purge]
//! mode = "deferred"
//! max_attempts = 3
//! drain_limit = 200
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
mod dispatcher;
pub mod driver;
mod object_queue;
mod resolver;
mod trigger;
mod url_queue;

pub use config::{PurgeConfig, PurgeMode};
pub use consumer::{CleanupReport, PurgeConsumer, TickReport};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use driver::{DriverDescriptor, DriverError, PurgeDriver};
pub use object_queue::{ObjectQueue, ParseReport};
pub use resolver::{
    CacheTagScheme, DEFAULT_MAX_ARCHIVE_PAGES, DEFAULT_PERMALINK_TEMPLATE, DEFAULT_POSTS_PER_PAGE,
    ResolveError, Resolver, ResolverConfig,
};
pub use trigger::{PurgeTrigger, TriggerOutcome};
pub use url_queue::{Settled, UrlQueue};

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum PurgeError {
    /// No usable driver; nothing is enqueued or consumed in this state.
    #[error("cache purging is not configured: {0}")]
    NotConfigured(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Queue names derived from the site's queue key.
pub fn queue_names(queue_key: &str) -> (String, String) {
    (
        format!("{queue_key}_purge_objects"),
        format!("{queue_key}_purge_urls"),
    )
}

/// The two queues of the pipeline, as addressed by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Objects,
    Urls,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Objects => "objects",
            QueueKind::Urls => "urls",
        }
    }
}

impl FromStr for QueueKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "objects" => Ok(QueueKind::Objects),
            "urls" => Ok(QueueKind::Urls),
            other => Err(format!("unknown queue `{other}`, expected `objects` or `urls`")),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_follow_the_key() {
        let (objects, urls) = queue_names("blog");
        assert_eq!(objects, "blog_purge_objects");
        assert_eq!(urls, "blog_purge_urls");
    }

    #[test]
    fn queue_kind_parses_operator_names() {
        assert_eq!("objects".parse::<QueueKind>(), Ok(QueueKind::Objects));
        assert_eq!("urls".parse::<QueueKind>(), Ok(QueueKind::Urls));
        assert!("jobs".parse::<QueueKind>().is_err());
    }
}
