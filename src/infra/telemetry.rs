use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "edgepurge_tick_ms",
            Unit::Milliseconds,
            "Duration of one consumer tick in milliseconds."
        );
        describe_counter!(
            "edgepurge_dispatch_chunks_total",
            Unit::Count,
            "Purge requests sent to the driver, per driver."
        );
        describe_counter!(
            "edgepurge_dispatch_failures_total",
            Unit::Count,
            "Purge requests the driver failed, per driver."
        );
        describe_counter!(
            "edgepurge_items_flagged_failed_total",
            Unit::Count,
            "Queue items flagged failed after exhausting their attempts."
        );
    });
}
