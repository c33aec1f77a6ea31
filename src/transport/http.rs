//! HTTP surface: the WebSocket endpoint, a health probe and the publish
//! trigger, served by axum.

use std::io;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::PublishGateway;
use crate::client::{MessageSlot, TopicSubscriber};
use crate::transport::websocket::run_session;

/// Everything a request handler needs, injected once at startup.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn TopicSubscriber>,
    pub slot: Arc<dyn MessageSlot>,
    pub gateway: PublishGateway,
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", any(ws_handler))
        .route("/a", get(health_handler))
        .route("/m/{topic}/{data}", get(publish_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` is cancelled and in-flight requests drain.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn ws_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| session(socket, state)),
        Err(rejection) => {
            debug!("refusing non-websocket request on /ws: {rejection}");
            (StatusCode::BAD_REQUEST, rejection.body_text()).into_response()
        }
    }
}

async fn session(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4();
    debug!(%id, "websocket session started");

    let (sink, stream) = socket.split();
    let result = run_session(
        stream,
        sink,
        state.bus.as_ref(),
        state.slot.as_ref(),
        &state.shutdown,
    )
    .await;

    match result {
        Ok(end) => debug!(%id, ?end, "websocket session ended"),
        Err(e) => warn!(%id, "websocket session failed: {e}"),
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": 200, "message": "a" }))
}

async fn publish_handler(
    State(state): State<AppState>,
    Path((topic, data)): Path<(String, String)>,
) -> Response {
    match state.gateway.publish(&topic, &data) {
        Ok(()) => Json(json!({ "status": 200, "topic": topic, "data": data })).into_response(),
        Err(e) => {
            warn!("publish trigger failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": 500, "message": "publish failed" })),
            )
                .into_response()
        }
    }
}
