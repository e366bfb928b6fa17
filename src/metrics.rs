//! Prometheus metrics

use std::net::SocketAddr;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tonic::Code;

/// Install the Prometheus exporter with its scrape endpoint
pub fn setup_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!(%addr, "Prometheus metrics exporter installed");

    Ok(())
}

/// Record a call entering the proxy
pub fn record_call_started(method: &str) {
    metrics::counter!("grpc_fanout_calls_total",
        "method" => method.to_string()
    )
    .increment(1);
    metrics::gauge!("grpc_fanout_inflight_calls").increment(1.0);
}

/// Record a call completing successfully
pub fn record_call_completed(_method: &str) {
    metrics::gauge!("grpc_fanout_inflight_calls").decrement(1.0);
}

/// Record a call failing with a terminal status
pub fn record_call_failed(method: &str, code: Code) {
    metrics::counter!("grpc_fanout_call_failures_total",
        "method" => method.to_string(),
        "code" => format!("{code:?}")
    )
    .increment(1);
    metrics::gauge!("grpc_fanout_inflight_calls").decrement(1.0);
}

/// Record frames relayed through a forwarding pipeline
pub fn record_frames_forwarded(direction: &'static str, count: u64) {
    metrics::counter!("grpc_fanout_frames_forwarded_total",
        "direction" => direction
    )
    .increment(count);
}
