//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kestrel=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record the in-flight operation gauges (total plus one per kind).
pub fn record_operations_inflight(kind: &'static str, count: u64) {
    metrics::gauge!("kestrel_operations_inflight", "kind" => kind).set(count as f64);
}

/// Record a finished operation with its terminal outcome.
pub fn record_operation_finished(kind: &'static str, duration_us: u64, success: bool) {
    metrics::counter!("kestrel_operations_total", "kind" => kind, "success" => success.to_string())
        .increment(1);
    metrics::histogram!("kestrel_operation_duration_us", "kind" => kind)
        .record(duration_us as f64);
}

/// Record a completed maintenance operation.
pub fn record_maintenance_op(name: &str, duration_us: u64) {
    metrics::counter!("kestrel_maintenance_ops_total", "op" => name.to_string()).increment(1);
    metrics::histogram!("kestrel_maintenance_duration_us", "op" => name.to_string())
        .record(duration_us as f64);
}
