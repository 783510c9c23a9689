//! Client-facing HTTP surface: the websocket upgrade endpoint and a
//! health probe. Everything realtime happens behind `/ws`.

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::{self, ConnectionContext};
use crate::hub::HubHandle;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ConnectionContext>,
    pub hub: HubHandle,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let ctx = state.ctx.clone();
    ws.max_message_size(ctx.ws.max_frame_bytes)
        .on_upgrade(move |socket| connection::handle_socket(socket, ctx))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats().await;
    Json(json!({
        "status": "ok",
        "uptimeSeconds": (chrono::Utc::now() - state.started_at).num_seconds(),
        "hub": {
            "clients": stats.clients,
            "usersOnline": stats.users_online,
            "rooms": stats.rooms,
            "messagesTotal": stats.messages_total,
            "messagesPerSec": stats.messages_per_sec,
            "droppedTotal": stats.dropped_total,
        },
    }))
}

/// Bind and serve until the context's shutdown token fires.
pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let shutdown = state.ctx.shutdown.clone();
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Server listening on {}", bind_addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
