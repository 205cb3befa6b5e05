//! HTTP routes and handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use protocol::{
    event_payload, ExecRequest, ExecResponse, ExtensionStatus, InputAck, InputRequest,
    StreamEvent, Terminal, TerminateRequest,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::error::{decode, ApiError};
use crate::config::PtyConfig;
use crate::service::ExecService;
use crate::session::PtyBridge;

/// Chunks queued in either direction of a PTY socket.
const PTY_CHANNEL_CAPACITY: usize = 64;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExecService>,
    pub pty: PtyConfig,
    /// Port the server is bound to, advertised in terminal listings.
    pub port: u16,
}

/// Create the router with every endpoint, CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/exec", post(exec_once))
        .route(
            "/api/exec/stream",
            get(list_terminals).post(exec_stream).delete(terminate),
        )
        .route("/api/exec/input", post(inject_input))
        .route("/api/exec/ws", get(pty_socket))
        .route("/api/verify", get(verify))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// POST /api/exec - Run a command to completion
async fn exec_once(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExecResponse>, ApiError> {
    let request: ExecRequest = decode(&body)?;
    debug!(cmd = %request.cmd, "One-shot exec");
    Ok(Json(state.service.exec_once(&request.cmd).await))
}

/// GET /api/exec/stream - List live terminals
async fn list_terminals(State(state): State<AppState>) -> Json<Vec<Terminal>> {
    Json(state.service.list_terminals(state.port))
}

/// POST /api/exec/stream - Run a command in a terminal session and stream events
async fn exec_stream(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: ExecRequest = decode(&body)?;
    let events = state.service.exec_stream(&request).await?;

    let headers = [(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    )];
    Ok((headers, Sse::new(event_stream(events)).keep_alive(KeepAlive::default())).into_response())
}

/// Turn stream events into SSE frames. Dropping the stream closes `events`.
fn event_stream(
    mut events: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event_payload(&event) {
                Ok(data) => yield Ok(Event::default().data(data)),
                Err(e) => error!(error = %e, "Failed to encode stream event"),
            }
        }
    }
}

/// DELETE /api/exec/stream - Terminate a terminal session
async fn terminate(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let request: TerminateRequest = decode(&body)?;
    let terminal_id = request.terminal_id();
    let terminated = state.service.terminate(terminal_id).await;
    debug!(terminal_id = %terminal_id, terminated, "Terminate requested");
    Ok(StatusCode::OK)
}

/// POST /api/exec/input - Write raw input to a process by pid
async fn inject_input(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InputAck>, ApiError> {
    let request: InputRequest = decode(&body)?;
    state
        .service
        .inject_input(request.pid, request.input.as_bytes())
        .await?;
    Ok(Json(InputAck::success()))
}

/// GET /api/verify - Readiness probe
async fn verify() -> Json<ExtensionStatus> {
    Json(ExtensionStatus {
        ready: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/exec/ws - Upgrade to a raw PTY shell
async fn pty_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let shutdown = state.service.shutdown_token();
    ws.on_upgrade(move |socket| bridge_socket(socket, state.pty, shutdown))
}

/// Adapt a WebSocket to the PTY bridge's byte channels.
async fn bridge_socket(mut socket: WebSocket, pty: PtyConfig, shutdown: CancellationToken) {
    let shell = pty.resolved_shell();
    let bridge = match PtyBridge::spawn(&shell, pty.cols, pty.rows) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(shell = %shell, error = %e, "Failed to open PTY bridge");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let pid = bridge.pid();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_CAPACITY);

    let bridge_task = tokio::spawn(bridge.run(in_rx, out_tx));

    let mut send_task = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if ws_sink.send(Message::Binary(chunk)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_stream.next().await {
            let data = match message {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if in_tx.send(data).await.is_err() {
                break;
            }
        }
    });

    let send_done = tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            true
        }
        _ = &mut recv_task => false,
        _ = shutdown.cancelled() => {
            recv_task.abort();
            false
        }
    };

    if let Err(e) = bridge_task.await {
        error!(error = %e, "PTY bridge task failed");
    }
    if !send_done {
        let _ = send_task.await;
    }
    info!(pid = ?pid, "PTY socket closed");
}
