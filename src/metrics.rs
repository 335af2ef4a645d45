//! Prometheus metrics for the MySQL operator

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::crd::ClusterState;

lazy_static::lazy_static! {
    /// Total reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "mysql_operator_reconciliations_total",
        "Total number of reconciliations",
        &["cluster", "result"]
    ).unwrap();

    /// Reconciliation duration
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "mysql_operator_reconciliation_duration_seconds",
        "Duration of reconciliations",
        &["cluster"]
    ).unwrap();

    /// Members passing readiness
    pub static ref READY_NODES: GaugeVec = register_gauge_vec!(
        "mysql_operator_cluster_ready_nodes",
        "Number of ready members per cluster",
        &["cluster"]
    ).unwrap();

    /// Current cluster state, one-hot
    pub static ref CLUSTER_STATE: GaugeVec = register_gauge_vec!(
        "mysql_operator_cluster_state",
        "Current state of each cluster",
        &["cluster", "state"]
    ).unwrap();

    /// Members deleted to move them onto a new revision
    pub static ref MEMBER_UPDATES: CounterVec = register_counter_vec!(
        "mysql_operator_member_updates_total",
        "Total number of members restarted by rolling updates",
        &["cluster"]
    ).unwrap();

    /// Leadership transfers issued by rolling updates
    pub static ref LEADER_TRANSFERS: CounterVec = register_counter_vec!(
        "mysql_operator_leader_transfers_total",
        "Total number of leadership transfers",
        &["cluster"]
    ).unwrap();

    /// Storage expansions
    pub static ref PVC_EXPANSIONS: CounterVec = register_counter_vec!(
        "mysql_operator_pvc_expansions_total",
        "Total number of storage expansions",
        &["cluster"]
    ).unwrap();

    /// Operator errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "mysql_operator_errors_total",
        "Total number of errors",
        &["type"]
    ).unwrap();
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Metrics server started");

    loop {
        match listener.accept().await {
            Ok((mut socket, _)) => {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;

                    let response = http_ok("text/plain; version=0.0.4; charset=utf-8", &render());
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
            Err(e) => warn!(error = %e, "Failed to accept metrics connection"),
        }
    }
}

/// Encode every registered metric in the text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

/// Minimal HTTP/1.1 200 response.
pub fn http_ok(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

/// Record a successful reconciliation
pub fn record_reconciliation_success(cluster: &str, duration_secs: f64) {
    RECONCILIATIONS.with_label_values(&[cluster, "success"]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

/// Record a failed reconciliation
pub fn record_reconciliation_failure(cluster: &str, duration_secs: f64) {
    RECONCILIATIONS.with_label_values(&[cluster, "failure"]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

/// Publish ready members and the one-hot state of a cluster.
pub fn set_cluster_status(cluster: &str, ready_nodes: i32, state: Option<ClusterState>) {
    READY_NODES.with_label_values(&[cluster]).set(ready_nodes as f64);
    for candidate in ClusterState::ALL {
        let value = if Some(candidate) == state { 1.0 } else { 0.0 };
        CLUSTER_STATE
            .with_label_values(&[cluster, candidate.as_str()])
            .set(value);
    }
}

pub fn record_member_update(cluster: &str) {
    MEMBER_UPDATES.with_label_values(&[cluster]).inc();
}

pub fn record_leader_transfer(cluster: &str) {
    LEADER_TRANSFERS.with_label_values(&[cluster]).inc();
}

pub fn record_storage_expansion(cluster: &str) {
    PVC_EXPANSIONS.with_label_values(&[cluster]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
