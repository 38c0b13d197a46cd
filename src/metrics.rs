//! Prometheus metrics for bleepraft.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, and exposes the `/metrics` endpoint
//! handler used by the admin API.

use axum::response::IntoResponse;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

// -- Metric name constants ----------------------------------------------------

/// Current term (gauge).
pub const CURRENT_TERM: &str = "bleepraft_current_term";

/// Commit index (gauge).
pub const COMMIT_INDEX: &str = "bleepraft_commit_index";

/// Last applied index (gauge).
pub const LAST_APPLIED: &str = "bleepraft_last_applied";

/// Total inbound RPCs dispatched (counter). Labels: kind.
pub const RPCS_TOTAL: &str = "bleepraft_rpcs_total";

/// Total log entries applied to the state machine (counter).
pub const ENTRIES_APPLIED_TOTAL: &str = "bleepraft_entries_applied_total";

/// Total elections started (counter).
pub const ELECTIONS_TOTAL: &str = "bleepraft_elections_total";

/// Total snapshots captured (counter).
pub const SNAPSHOTS_TAKEN_TOTAL: &str = "bleepraft_snapshots_taken_total";

/// Total snapshots installed from a leader (counter).
pub const SNAPSHOTS_INSTALLED_TOTAL: &str = "bleepraft_snapshots_installed_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_gauge!(CURRENT_TERM, "Current term");
    describe_gauge!(COMMIT_INDEX, "Commit index");
    describe_gauge!(LAST_APPLIED, "Last applied log index");
    describe_counter!(RPCS_TOTAL, "Inbound RPCs dispatched, by kind");
    describe_counter!(ENTRIES_APPLIED_TOTAL, "Log entries applied to the state machine");
    describe_counter!(ELECTIONS_TOTAL, "Elections started");
    describe_counter!(SNAPSHOTS_TAKEN_TOTAL, "Snapshots captured locally");
    describe_counter!(SNAPSHOTS_INSTALLED_TOTAL, "Snapshots installed from a leader");
}

/// `GET /metrics` -- render the Prometheus exposition format.
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}
