//! Prometheus metrics for kvetch.
#![allow(clippy::cast_precision_loss)]
//!
//! Metrics are exposed at `GET /metrics` on the metrics listener in
//! Prometheus text format. Recording is a no-op until [`init_metrics`]
//! installs the recorder, so engines and tests can record freely.
//!
//! # Metrics Exposed
//!
//! ## Request Metrics
//! - `kvetch_http_requests_total` - Total HTTP requests (labels: method, path, status)
//! - `kvetch_http_request_duration_seconds` - Request duration histogram
//!
//! ## Store Metrics
//! - `kvetch_get_requests_total` - Get items resolved (labels: kind)
//! - `kvetch_set_requests_total` - Write batches applied (labels: ttl)
//! - `kvetch_entries_written_total` - Entries written across all batches
//!
//! ## Subscription Metrics
//! - `kvetch_subscriptions_active` - Currently open subscriptions
//! - `kvetch_feed_failures_total` - Subscriptions failed by the hub (labels: reason)
//!
//! ## Reclamation Metrics
//! - `kvetch_reclaim_runs_total` - Reclamation runs (labels: outcome)
//! - `kvetch_reclaimed_entries_total` - Expired entries physically removed
//! - `kvetch_reclaim_duration_seconds` - Reclamation run duration histogram

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the metrics system.
///
/// Call once at startup. A second call returns the handle installed by
/// the first.
///
/// # Errors
///
/// Returns [`Error::Internal`] if another global recorder is already
/// installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("failed to install Prometheus recorder: {e}")))?;

    register_metrics();
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    Ok(handle)
}

/// Registers all metric descriptions.
fn register_metrics() {
    describe_counter!("kvetch_http_requests_total", "Total number of HTTP requests");
    describe_histogram!(
        "kvetch_http_request_duration_seconds",
        "HTTP request duration in seconds"
    );

    describe_counter!("kvetch_get_requests_total", "Total Get items resolved");
    describe_counter!("kvetch_set_requests_total", "Total write batches applied");
    describe_counter!(
        "kvetch_entries_written_total",
        "Total entries written across all batches"
    );

    describe_gauge!("kvetch_subscriptions_active", "Currently open subscriptions");
    describe_counter!(
        "kvetch_feed_failures_total",
        "Subscriptions failed by the change hub"
    );

    describe_counter!("kvetch_reclaim_runs_total", "Total reclamation runs");
    describe_counter!(
        "kvetch_reclaimed_entries_total",
        "Expired entries physically removed by reclamation"
    );
    describe_histogram!(
        "kvetch_reclaim_duration_seconds",
        "Reclamation run duration in seconds"
    );
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Records an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    counter!(
        "kvetch_http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        "kvetch_http_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(duration_secs);
}

// =============================================================================
// Store Metrics
// =============================================================================

/// Records a Get call with its point and prefix item counts.
pub fn record_get(points: usize, prefixes: usize) {
    if points > 0 {
        counter!("kvetch_get_requests_total", "kind" => "key").increment(points as u64);
    }
    if prefixes > 0 {
        counter!("kvetch_get_requests_total", "kind" => "prefix").increment(prefixes as u64);
    }
}

/// Records an applied write batch.
pub fn record_set(entries: usize, with_ttl: bool) {
    counter!(
        "kvetch_set_requests_total",
        "ttl" => if with_ttl { "true" } else { "false" }
    )
    .increment(1);
    counter!("kvetch_entries_written_total").increment(entries as u64);
}

// =============================================================================
// Subscription Metrics
// =============================================================================

pub fn subscription_opened() {
    gauge!("kvetch_subscriptions_active").increment(1.0);
}

pub fn subscription_closed() {
    gauge!("kvetch_subscriptions_active").decrement(1.0);
}

/// Records a subscription failed by the hub.
pub fn record_feed_failure(reason: &'static str) {
    counter!("kvetch_feed_failures_total", "reason" => reason).increment(1);
}

// =============================================================================
// Reclamation Metrics
// =============================================================================

/// Records a reclamation run.
pub fn record_reclaim(outcome: &'static str, entries: usize, duration_secs: f64) {
    counter!("kvetch_reclaim_runs_total", "outcome" => outcome).increment(1);
    if entries > 0 {
        counter!("kvetch_reclaimed_entries_total").increment(entries as u64);
    }
    histogram!("kvetch_reclaim_duration_seconds").record(duration_secs);
}
