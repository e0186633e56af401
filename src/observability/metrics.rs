//! Metrics exposition.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics_exporter_prometheus::PrometheusBuilder;

static PREFIX: OnceLock<String> = OnceLock::new();

/// Initialize the Prometheus exporter and remember the name prefix.
pub fn init_metrics(addr: SocketAddr, prefix: &str) {
    let _ = PREFIX.set(prefix.to_string());

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!(address = %addr, "metrics exposition listening");
}

/// Apply the configured prefix to a metric name.
pub fn prefixed(name: &str) -> String {
    match PREFIX.get() {
        Some(prefix) if !prefix.is_empty() => format!("{}{}", prefix, name),
        _ => name.to_string(),
    }
}
