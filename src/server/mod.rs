use crate::badge::BadgeBoard;
use crate::coordinator::CoordinatorHandle;
use crate::model::{FrameId, SenderInfo, TabId};
use crate::peer::{ChannelPeer, Peer, PeerCommand};
use crate::settings::{SettingsError, SettingsStore, CLOSE_ON_SPAM_KEY};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
struct ServerState {
    token: String,
    coordinator: CoordinatorHandle,
    store: SettingsStore,
    badges: BadgeBoard,
}

pub async fn start(
    addr: SocketAddr,
    token: String,
    coordinator: CoordinatorHandle,
    store: SettingsStore,
    badges: BadgeBoard,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(ServerState {
        token,
        coordinator,
        store,
        badges,
    });

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "coordinator listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/connect", get(ws_handler))
        .route("/state", get(state_snapshot))
        .route("/badges", get(badge_snapshot))
        .route("/settings", post(settings_submit))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let name = query.0.get("name").cloned().unwrap_or_default();
    let sender = sender_from_query(&query.0);
    let coordinator = state.coordinator.clone();
    ws.on_upgrade(move |socket| async move {
        let (peer, commands) = ChannelPeer::new();
        let conn = peer.id();
        coordinator.connected(Arc::new(peer), name, sender);
        handle_socket(socket, commands, &coordinator, conn).await;
        coordinator.disconnected(conn);
    })
}

fn sender_from_query(query: &HashMap<String, String>) -> SenderInfo {
    let tab = query
        .get("tab")
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(TabId::new);
    let frame = query
        .get("frame")
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .map(FrameId)
        .unwrap_or(FrameId::MAIN);
    SenderInfo { tab, frame }
}

/// Pumps one socket until either side closes it.
async fn handle_socket(
    mut socket: WebSocket,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    coordinator: &CoordinatorHandle,
    conn: crate::model::ConnectionId,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Post(message)) => {
                    if socket.send(Message::Text(message.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(PeerCommand::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let message = serde_json::from_str(&text).unwrap_or(Value::Null);
                    coordinator.message(conn, message);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            }
        }
    }
}

async fn state_snapshot(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.coordinator.snapshot().await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "coordinator stopped").into_response(),
    }
}

async fn badge_snapshot(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    (StatusCode::OK, Json(state.badges.snapshot())).into_response()
}

#[derive(Debug, Deserialize)]
struct SettingsPayload {
    #[serde(rename = "closeOnSpam")]
    close_on_spam: bool,
}

async fn settings_submit(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(payload): Json<SettingsPayload>,
) -> impl IntoResponse {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()).into_response();
    }

    match state
        .store
        .set(CLOSE_ON_SPAM_KEY, Value::Bool(payload.close_on_spam))
        .await
    {
        Ok(()) => (StatusCode::OK, "Settings saved".to_string()).into_response(),
        Err(err @ SettingsError::RateLimited { .. }) => {
            (StatusCode::TOO_MANY_REQUESTS, err.to_string()).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "settings write failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save settings: {}", err),
            )
                .into_response()
        }
    }
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}
