//! Prometheus metrics exporter and scrape endpoint.

use axum::{Router, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{error, info};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder. Must run before any metric is touched so
/// gauges initialized to zero show up on the first scrape.
pub fn init_metrics_recorder() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    let _ = METRICS_HANDLE.set(handle);
}

/// Zero the gauges and counters that dashboards expect to exist even
/// before the first event.
pub fn initialize_metrics() {
    metrics::gauge!("ws.connections.active").set(0.0);
    metrics::gauge!("hub.clients.active").set(0.0);
    metrics::gauge!("hub.rooms.active").set(0.0);
    metrics::gauge!("hub.users.online").set(0.0);
    metrics::gauge!("location.queue.depth").set(0.0);
    metrics::gauge!("geofence.queue.depth").set(0.0);
    metrics::gauge!("notify.queue.depth").set(0.0);
    metrics::counter!("location.processed_total").absolute(0);
    metrics::counter!("geofence.events_total", "kind" => "entry").absolute(0);
    metrics::counter!("geofence.events_total", "kind" => "exit").absolute(0);
    metrics::counter!("notify.sent_total").absolute(0);
    metrics::counter!("hub.messages.broadcast_total").absolute(0);
}

async fn metrics_handler() -> impl IntoResponse {
    match METRICS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

/// Serve `/metrics` on its own port, away from the client-facing surface.
pub async fn start_metrics_server(port: u16) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Metrics server listening on {}", addr);
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server exited");
            }
        }
        Err(e) => error!(error = %e, %addr, "Failed to bind metrics server"),
    }
}
