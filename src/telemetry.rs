use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
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
        .map_err(|err| AppError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "vetrina_cache_hit_total",
            Unit::Count,
            "Total number of file-cache hits."
        );
        describe_counter!(
            "vetrina_cache_miss_total",
            Unit::Count,
            "Total number of file-cache misses (absent, expired, or unreadable)."
        );
        describe_counter!(
            "vetrina_cache_write_total",
            Unit::Count,
            "Total number of file-cache entries written."
        );
        describe_counter!(
            "vetrina_cache_swept_total",
            Unit::Count,
            "Total number of file-cache entries removed by cleanup sweeps."
        );
        describe_counter!(
            "vetrina_db_query_total",
            Unit::Count,
            "Total number of SQL statements executed against the database."
        );
        describe_counter!(
            "vetrina_db_memo_hit_total",
            Unit::Count,
            "Total number of read statements served from the in-process memo."
        );
        describe_counter!(
            "vetrina_db_error_total",
            Unit::Count,
            "Total number of failed SQL statements."
        );
        describe_histogram!(
            "vetrina_db_statement_ms",
            Unit::Milliseconds,
            "SQL statement latency in milliseconds."
        );
    });
}
