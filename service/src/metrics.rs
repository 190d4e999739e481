//! Prometheus metrics for request dispatch.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `registration_requests_total{action,outcome}` - Requests by action and outcome
//!   (`completed`, `rejected`, `retry`)
//! - `registration_request_errors_total{kind}` - Failed requests by error kind
//! - `registration_store_operations_total{operation,result}` - Store calls, recorded
//!   by the `PostgreSQL` store
//!
//! ## Histograms
//! - `registration_request_duration_seconds{action}` - Time from dispatch to ack/nack decision

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics exporter setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter could not be configured
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),

    /// The exporter could not be installed as the global recorder
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Register all metric descriptions.
///
/// Call once at startup, before any metric is recorded.
pub fn register_metrics() {
    describe_counter!(
        "registration_requests_total",
        "Total number of change requests by action and outcome (completed, rejected, retry)"
    );
    describe_counter!(
        "registration_request_errors_total",
        "Total number of failed change requests by error kind"
    );
    describe_counter!(
        "registration_store_operations_total",
        "Total number of store operations by operation and result"
    );
    describe_histogram!(
        "registration_request_duration_seconds",
        "Time taken to process a change request"
    );

    tracing::debug!("Registration metrics registered");
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// # Errors
///
/// Returns [`MetricsError`] if the exporter cannot be built or installed (for
/// example when a recorder is already installed or the port is taken).
pub fn install_prometheus(addr: SocketAddr) -> Result<(), MetricsError> {
    register_metrics();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    tracing::info!(%addr, "Metrics server started - available at http://{addr}/metrics");
    Ok(())
}

/// Record one dispatched request.
pub fn record_request(action: &'static str, outcome: &'static str, error_kind: Option<&'static str>, elapsed: Duration) {
    counter!("registration_requests_total", "action" => action, "outcome" => outcome).increment(1);
    histogram!("registration_request_duration_seconds", "action" => action).record(elapsed.as_secs_f64());
    if let Some(kind) = error_kind {
        counter!("registration_request_errors_total", "kind" => kind).increment(1);
    }
}
