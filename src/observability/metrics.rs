//! # Metrics Collection
//!
//! Synchronization metrics recorded through the `metrics` facade. Without an
//! installed exporter every call is a no-op.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use crate::config::ObservabilityConfig;
use crate::{Error, Result};

pub const SYNC_PASSES_TOTAL: &str = "edgesync_sync_passes_total";
pub const SYNC_PASS_DURATION_SECONDS: &str = "edgesync_sync_pass_duration_seconds";
pub const DOMAIN_CONFLICTS_TOTAL: &str = "edgesync_domain_conflicts_total";
pub const CACHE_OWNERS: &str = "edgesync_cache_owners";
pub const SNAPSHOT_RESOURCES: &str = "edgesync_snapshot_resources";

/// Record the outcome of one synchronization pass.
///
/// `failed_phase` is `None` for successful passes.
pub fn record_sync_pass(node_id: &str, failed_phase: Option<&str>, duration: f64) {
    let outcome = if failed_phase.is_some() { "error" } else { "success" };
    let labels = [
        ("node_id", node_id.to_string()),
        ("outcome", outcome.to_string()),
        ("phase", failed_phase.unwrap_or("none").to_string()),
    ];
    counter!(SYNC_PASSES_TOTAL, &labels).increment(1);

    let duration_labels = [("node_id", node_id.to_string())];
    histogram!(SYNC_PASS_DURATION_SECONDS, &duration_labels).record(duration);
}

/// Record a route set rejected for claiming another owner's domain
pub fn record_domain_conflict(owner: &str) {
    let labels = [("owner", owner.to_string())];
    counter!(DOMAIN_CONFLICTS_TOTAL, &labels).increment(1);
}

/// Update the owner gauge after a cache mutation
pub fn update_cache_owners(count: usize) {
    gauge!(CACHE_OWNERS).set(count as f64);
}

/// Update the per-kind resource gauge for the snapshot just published
pub fn update_snapshot_resources(node_id: &str, kind: &str, count: usize) {
    let labels = [("node_id", node_id.to_string()), ("kind", kind.to_string())];
    gauge!(SNAPSHOT_RESOURCES, &labels).set(count as f64);
}

fn describe_metrics() {
    describe_counter!(SYNC_PASSES_TOTAL, Unit::Count, "Synchronization passes by outcome");
    describe_histogram!(
        SYNC_PASS_DURATION_SECONDS,
        Unit::Seconds,
        "Wall-clock duration of a synchronization pass"
    );
    describe_counter!(
        DOMAIN_CONFLICTS_TOTAL,
        Unit::Count,
        "Route sets rejected because a domain is owned elsewhere"
    );
    describe_gauge!(CACHE_OWNERS, Unit::Count, "Route-set owners held in the cache");
    describe_gauge!(SNAPSHOT_RESOURCES, Unit::Count, "Resources in the last published snapshot");
}

/// Initialize metrics collection and Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", "edgesync")
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    describe_metrics();

    info!(metrics_addr = %metrics_addr, "Metrics collection initialized");
    Ok(())
}
