//! HTTP surface: health probe and the real-time socket.
//!
//! Everything else (workspace/session CRUD, auth middleware for it) lives
//! in the external API layer; this router only carries the gateway
//! endpoint and wires admitted sockets into it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::gateway::{AuthConfig, Gateway, OutboundFrame};
use crate::store::WorkspaceStore;
use crate::supervisor::AgentSupervisor;
use crate::user_terminal::UserTerminalSupervisor;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub agents: Arc<AgentSupervisor>,
    pub terminals: Arc<UserTerminalSupervisor>,
}

impl AppState {
    pub fn new(auth: AuthConfig, store: Arc<dyn WorkspaceStore>) -> Arc<Self> {
        let gateway = Arc::new(Gateway::new(auth));
        Self::with_gateway(gateway, store)
    }

    pub fn with_gateway(gateway: Arc<Gateway>, store: Arc<dyn WorkspaceStore>) -> Arc<Self> {
        let agents = Arc::new(AgentSupervisor::new(store, gateway.clone()));
        let terminals = Arc::new(UserTerminalSupervisor::new(gateway.clone()));
        gateway.attach_supervisors(&agents, &terminals);
        Arc::new(Self {
            gateway,
            agents,
            terminals,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/ws", get(ws_handler))
        .fallback(not_found)
        .with_state(state);

    let http_logging = match std::env::var("WORKDECK_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

/// Stop the supervised processes first, then close the gateway.
pub async fn shutdown_components(state: &Arc<AppState>) {
    state.agents.stop_all().await;
    state.terminals.stop_all().await;
    state.gateway.shutdown().await;
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// Validate the shared secret before completing the handshake. A rejected
/// connection is never registered and can never be reached by broadcast.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.gateway.authorize(params.token.as_deref()).is_err() {
        tracing::warn!("rejecting websocket connection: bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let connection = gateway.register(outbound_tx).await;
    let connection_id = connection.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                OutboundFrame::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => ws_tx.send(Message::Text(json)).await,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to serialize event");
                        continue;
                    }
                },
                OutboundFrame::Ping => ws_tx.send(Message::Ping(Vec::new())).await,
                OutboundFrame::Close => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "closing".into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => gateway.handle_message(&connection, &text).await,
            Ok(Message::Pong(_)) => connection.mark_alive(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(connection_id, error = %err, "websocket receive error");
                break;
            }
        }
    }

    gateway.unregister(connection_id).await;
    send_task.abort();
}
