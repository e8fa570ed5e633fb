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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_cache_hit_total",
            Unit::Count,
            "Responses served from the shared page cache."
        );
        describe_counter!(
            "quire_cache_miss_total",
            Unit::Count,
            "Cacheable requests that had to be rendered."
        );
        describe_counter!(
            "quire_cache_store_total",
            Unit::Count,
            "Rendered responses written to the page cache."
        );
        describe_counter!(
            "quire_cache_bypass_total",
            Unit::Count,
            "Requests that skipped the page cache, labelled by reason."
        );
        describe_counter!(
            "quire_cache_backend_error_total",
            Unit::Count,
            "Response store operations that failed or timed out."
        );
        describe_counter!(
            "quire_cache_registration_dropped_total",
            Unit::Count,
            "Stored pages whose dependencies were not registered because the queue was full."
        );
        describe_histogram!(
            "quire_cache_lookup_ms",
            Unit::Milliseconds,
            "Page cache lookup latency in milliseconds."
        );
        describe_counter!(
            "quire_invalidation_sent_total",
            Unit::Count,
            "Invalidation messages published, labelled by type."
        );
        describe_counter!(
            "quire_invalidation_failed_total",
            Unit::Count,
            "Invalidation messages that could not be published."
        );
        describe_counter!(
            "quire_invalidation_received_total",
            Unit::Count,
            "Invalidation messages consumed from the bus."
        );
        describe_counter!(
            "quire_invalidation_evicted_total",
            Unit::Count,
            "Cache entries evicted by invalidation messages."
        );
    });
}
