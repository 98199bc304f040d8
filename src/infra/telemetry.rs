use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Logs go to stderr so that rendered documents on stdout stay clean.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer(logging.format))
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
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
    }
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tessera_cache_hit_total",
            Unit::Count,
            "Total number of fresh cache hits, labelled by store."
        );
        describe_counter!(
            "tessera_cache_miss_total",
            Unit::Count,
            "Total number of cache misses, labelled by store."
        );
        describe_counter!(
            "tessera_cache_expired_total",
            Unit::Count,
            "Total number of lookups that found an expired entry."
        );
        describe_counter!(
            "tessera_cache_contention_total",
            Unit::Count,
            "Total number of lookups that found another caller recomputing the key."
        );
        describe_counter!(
            "tessera_cache_store_total",
            Unit::Count,
            "Total number of new entries written to a store."
        );
        describe_counter!(
            "tessera_cache_update_total",
            Unit::Count,
            "Total number of entries refreshed in place."
        );
        describe_counter!(
            "tessera_cache_evict_total",
            Unit::Count,
            "Total number of cache evictions due to capacity."
        );
        describe_counter!(
            "tessera_cache_sweep_removed_total",
            Unit::Count,
            "Total number of expired entries removed by the sweeper."
        );
        describe_histogram!(
            "tessera_block_invoke_ms",
            Unit::Milliseconds,
            "Block invocation latency in milliseconds, cache lookups included."
        );
        describe_counter!(
            "tessera_block_invocations_total",
            Unit::Count,
            "Total number of block invocations, labelled by block and outcome."
        );
        describe_counter!(
            "tessera_script_cache_hit_total",
            Unit::Count,
            "Total number of script loads served from the parsed-script cache."
        );
        describe_counter!(
            "tessera_script_parse_total",
            Unit::Count,
            "Total number of script files parsed."
        );
    });
}
