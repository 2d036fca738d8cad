//! WebSocket endpoint that exposes a [`Host`] to foreground clients.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::Host;
use crate::bridge::protocol::Request;
use crate::bridge::transport::Connection;

/// Build the Axum router with the bridge WebSocket and health routes.
pub fn bridge_routes(host: Arc<Host>) -> Router {
    Router::new()
        .route("/ws/bridge", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(host)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(host): State<Arc<Host>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskbridge",
        "running_workflows": host.running_count(),
        "steps": host.step_names().await,
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(host): State<Arc<Host>>) -> impl IntoResponse {
    info!("Bridge client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, host))
}

async fn handle_socket(mut socket: WebSocket, host: Arc<Host>) {
    let Connection {
        requests,
        mut events,
    } = host.connect();
    info!("Bridge client connected");

    loop {
        tokio::select! {
            // Forward host events to this client
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("Host closed the connection");
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize bridge event"),
                }
            }

            // Receive requests from client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Request>(&text) {
                        Ok(request) => {
                            if requests.send(request).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Invalid bridge request"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Bridge client disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Bridge socket error");
                        break;
                    }
                }
            }
        }
    }
}
