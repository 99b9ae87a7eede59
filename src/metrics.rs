//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a completed model load
pub fn record_load(key: &str, model: &str, source: &str) {
    metrics::counter!("embed_pool_loads_total",
        "key" => key.to_string(),
        "model" => model.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a load that surfaced an error
pub fn record_load_failure(key: &str) {
    metrics::counter!("embed_pool_load_failures_total",
        "key" => key.to_string()
    )
    .increment(1);
}

/// Record one recovery step
pub fn record_recovery(action: &'static str) {
    metrics::counter!("embed_pool_recoveries_total", "action" => action).increment(1);
}

/// Record a pool clear
pub fn record_clear() {
    metrics::counter!("embed_pool_clears_total").increment(1);
}

/// Update loaded handle count gauge
pub fn update_handle_count(count: usize) {
    metrics::gauge!("embed_pool_handles").set(count as f64);
}
