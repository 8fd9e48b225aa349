use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::danmaku::connection::Session;
use crate::danmaku::message::UpstreamPacket;
use crate::danmaku::GatewayState;
use crate::emoji::EmojiCache;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub emoji: Arc<EmojiCache>,
    pub upstream_token: Option<String>,
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Fetches one normalized, cached emoji image by its content-hash key.
async fn get_emoji(Path(key): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    match state.emoji.get(&key).await {
        Some((bytes, content_type)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], (*bytes).clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Registers the socket as a viewer of `channel`; incoming frames are read
/// only to detect disconnect, their content is discarded.
async fn viewer_socket(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, channel, state))
}

async fn handle_viewer(socket: WebSocket, channel: String, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Session::new(tx);
    let id = state.gateway.connections.register_viewer(&channel, session).await;

    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        if frame.is_err() {
            break;
        }
    }

    state.gateway.connections.remove_viewer(&channel, id).await;
    forward.abort();
    debug!(channel = %channel, "viewer disconnected");
}

#[derive(Debug, Deserialize)]
struct UpstreamQuery {
    token: Option<String>,
}

/// The trusted control socket: token-authenticated, accepts danmaku and
/// control packets to inject and fan out.
async fn upstream_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<UpstreamQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(expected) = state.upstream_token.as_deref() else {
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket.send(WsMessage::Close(None)).await;
        });
    };

    match query.token.as_deref() {
        None => ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1008,
                    reason: "Missing authorization token".into(),
                })))
                .await;
        }),
        Some(token) if !constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(WsMessage::Close(Some(axum::extract::ws::CloseFrame {
                        code: 1008,
                        reason: "Invalid token".into(),
                    })))
                    .await;
            })
        }
        Some(_) => ws.on_upgrade(move |socket| handle_upstream(socket, state)),
    }
}

/// Compares two byte strings without branching on the position of the first
/// mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn handle_upstream(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Session::new(tx);
    let id = state.gateway.connections.register_upstream(session).await;

    let forward = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let WsMessage::Text(text) = frame else { continue };
        match parse_and_dispatch(&text, &state).await {
            Ok(()) => {}
            Err(reason) => {
                let error_frame = serde_json::json!({ "error": format!("Invalid message format: {reason}") });
                if state
                    .gateway
                    .connections
                    .send_to(id, WsMessage::Text(error_frame.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    state.gateway.connections.remove_upstream(id).await;
    forward.abort();
    warn!("upstream connection closed");
}

async fn parse_and_dispatch(text: &str, state: &AppState) -> Result<(), String> {
    let packet: UpstreamPacket = serde_json::from_str(text).map_err(|e| e.to_string())?;
    packet.validate().map_err(|e| e.to_string())?;

    if let Some(mut control) = packet.control {
        control.clamp();
        state.gateway.broadcast_control(&packet.channel, &control).await;
    } else if let Some(mut message) = packet.danmaku {
        // Upstream-injected messages are always treated as special.
        message.set_is_special(true);
        state.gateway.broadcast_message(&packet.channel, message).await;
    }
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/api/emoji/{key}", get(get_emoji))
        .route("/api/danmaku/v1/danmaku/{channel}", get(viewer_socket))
        .route("/api/danmaku/v1/upstream", get(upstream_socket))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn serve(config: &AppConfig, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "danmaku gateway listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received ctrl+c, shutting down"),
        _ = terminate => warn!("received sigterm, shutting down"),
    }
}
