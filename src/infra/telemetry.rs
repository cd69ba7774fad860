use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_CACHE_COMPUTE_MS, METRIC_CACHE_DOGPILE_WAIT, METRIC_CACHE_HIT,
    METRIC_CACHE_INVALIDATED, METRIC_CACHE_LOCK_TIMEOUT, METRIC_CACHE_MISS,
    METRIC_CACHE_STALE_POPULATE, METRIC_CACHE_STORE_ERROR,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
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
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
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

/// Register descriptions for the crate's metrics with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of query cache hits."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of query cache misses."
        );
        describe_counter!(
            METRIC_CACHE_STORE_ERROR,
            Unit::Count,
            "Cache store failures absorbed by fail-open handling, by phase."
        );
        describe_counter!(
            METRIC_CACHE_DOGPILE_WAIT,
            Unit::Count,
            "Callers that waited on another caller's computation of the same key."
        );
        describe_counter!(
            METRIC_CACHE_LOCK_TIMEOUT,
            Unit::Count,
            "Waits on an in-flight computation that timed out."
        );
        describe_counter!(
            METRIC_CACHE_STALE_POPULATE,
            Unit::Count,
            "Computed results not cached because their tags were invalidated mid-flight."
        );
        describe_counter!(
            METRIC_CACHE_INVALIDATED,
            Unit::Count,
            "Cache entries removed by tag invalidation."
        );
        describe_histogram!(
            METRIC_CACHE_COMPUTE_MS,
            Unit::Milliseconds,
            "Latency of computations run on a cache miss, in milliseconds."
        );
    });
}
