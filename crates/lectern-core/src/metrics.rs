//! Prometheus metrics helpers for Lectern.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lectern_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics().unwrap();
//!     start_metrics_server(9091, handle).await.unwrap();
//!
//!     metrics::counter!("ingest_events_total", "kind" => "note").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`relay_`, `ingest_`, `sync_`, `feed_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: low cardinality only (never relay URLs or event ids)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Serve `/metrics` on the given port from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded across Lectern.
fn register_metrics() {
    // Relay fan-out
    describe_counter!(
        "relay_queries_total",
        "Relay queries issued by the fan-out (label: status)"
    );
    describe_counter!(
        "relay_publish_total",
        "Publish attempts per relay (label: status)"
    );
    describe_counter!(
        "relay_events_received_total",
        "Events received from relays before deduplication"
    );
    describe_counter!(
        "relay_write_disabled_total",
        "Relays whose write capability was disabled after repeated publish failures"
    );

    // Ingestion
    describe_counter!(
        "ingest_events_total",
        "Events handed to the ingestion pipeline (label: kind)"
    );
    describe_counter!(
        "ingest_events_dropped_total",
        "Events dropped by the pipeline (label: reason)"
    );
    describe_counter!("ingest_garbage_total", "Notes flagged as garbage");
    describe_counter!(
        "ingest_notifications_total",
        "Notifications created for the local identity"
    );

    // Sync
    describe_counter!("sync_ticks_total", "Sync ticks (label: outcome)");
    describe_counter!(
        "sync_missing_refs_total",
        "Missing thread references queued for backfill"
    );
    describe_histogram!("sync_tick_duration_seconds", "Duration of a sync tick");
    describe_gauge!("sync_last_success_unix", "Unix time of the last successful sync");
    describe_gauge!("sync_running", "1 while the periodic sync loop is running");

    // Feeds
    describe_counter!("feed_pages_total", "Feed pages served (label: state)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_register_metrics_does_not_panic() {
        ensure_metrics_init();
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_recording_without_server_does_not_panic() {
        ensure_metrics_init();
        metrics::counter!("ingest_events_total", "kind" => "note").increment(1);
        metrics::gauge!("sync_last_success_unix").set(0.0);
    }
}
