//! Metrics collection and exposition.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Record one gateway request as seen at the server edge.
pub fn record_gateway_request(status: u16, started: Instant) {
    let labels = [("status", status.to_string())];
    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());
}

/// Record one cluster outcome (ok / rejection kind).
pub fn record_cluster_request(cluster: &str, outcome: &'static str) {
    counter!(
        "cluster_requests_total",
        "cluster" => cluster.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Update the health gauge for a member.
pub fn record_member_health(cluster: &str, member: &str, online: bool) {
    let val = if online { 1.0 } else { 0.0 };
    gauge!(
        "cluster_member_online",
        "cluster" => cluster.to_string(),
        "member" => member.to_string()
    )
    .set(val);
}

/// Track the shaper's live capacity.
pub fn record_shaper_size(cluster: &str, size: usize) {
    gauge!("cluster_shaper_size", "cluster" => cluster.to_string()).set(size as f64);
}

/// Record a faulted Flow run.
pub fn record_vm_fault(kind: &'static str) {
    counter!("flow_vm_faults_total", "kind" => kind).increment(1);
}
