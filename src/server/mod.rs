use crate::actuator::{ActuatorBus, ActuatorLink};
use crate::hub::FixtureHub;
use crate::model::{ClientMessage, SessionId};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(10);
const PROTOCOL_ERROR_CLOSE_THRESHOLD: usize = 5;
const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub client_token: Option<String>,
    pub actuator_token: String,
    pub allowed_origins: Vec<String>,
    pub outbound_queue: usize,
}

struct ServerState {
    hub: Arc<FixtureHub>,
    link: Arc<ActuatorLink>,
    settings: ServerSettings,
}

pub fn router(hub: Arc<FixtureHub>, link: Arc<ActuatorLink>, settings: ServerSettings) -> Router {
    let state = Arc::new(ServerState {
        hub,
        link,
        settings,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(client_ws_handler))
        .route("/actuator", get(actuator_ws_handler))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    connections: usize,
    actuator_connected: bool,
    fixtures: usize,
}

async fn health_check(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        connections: state.hub.connection_count(),
        actuator_connected: state.hub.actuator_connected(),
        fixtures: state.hub.catalog().len(),
    })
}

async fn client_ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Some(token) = state.settings.client_token.as_deref() {
        if !is_token_valid(&headers, &query.0, token) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    if !is_origin_allowed(&headers, &state.settings.allowed_origins) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let requested = requested_session(&headers, &query.0);
    if let Some(id) = &requested {
        if !id.is_well_formed() {
            return (StatusCode::BAD_REQUEST, "malformed session id").into_response();
        }
        if state.hub.is_session_live(id) {
            return (StatusCode::CONFLICT, "session already connected").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_client_socket(socket, state, requested))
}

async fn handle_client_socket(
    mut socket: WebSocket,
    state: Arc<ServerState>,
    requested: Option<SessionId>,
) {
    let (tx, mut rx) = mpsc::channel(state.settings.outbound_queue);
    let session_id = match state.hub.connect(requested, tx) {
        Ok(id) => id,
        Err(err) => {
            // lost a race with another upgrade for the same id
            tracing::warn!(error = %err, "refusing client socket");
            close_with(&mut socket, close_code::POLICY, err.to_string()).await;
            return;
        }
    };

    let mut protocol_errors = ProtocolErrorTracker::new();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(error = %err, event = event.event_name(), "failed to encode event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => state.hub.handle_message(&session_id, message),
                            Err(err) => {
                                tracing::warn!(session_id = %session_id, error = %err, "malformed client frame");
                                if protocol_errors.record_and_should_close() {
                                    close_with(&mut socket, close_code::POLICY, "too many malformed frames").await;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(session_id = %session_id, error = %err, "client socket error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.disconnect(&session_id);
}

async fn actuator_ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.settings.actuator_token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state.link.is_connected() {
        return (StatusCode::CONFLICT, "actuator link already attached").into_response();
    }

    ws.on_upgrade(move |socket| handle_actuator_socket(socket, state))
}

async fn handle_actuator_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let (link_id, mut commands) = match state.link.attach() {
        Ok(attached) => attached,
        Err(err) => {
            tracing::warn!(error = %err, "refusing actuator socket");
            close_with(&mut socket, close_code::POLICY, err.to_string()).await;
            return;
        }
    };
    tracing::info!(%link_id, "actuator link connected");
    state.hub.actuator_link_changed();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to encode actuator command");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(%link_id, message = %text, "actuator message ignored");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(%link_id, error = %err, "actuator socket error");
                        break;
                    }
                }
            }
        }
    }

    if state.link.detach(link_id) {
        tracing::info!(%link_id, "actuator link disconnected");
    }
    drop(commands);
    state.hub.actuator_link_changed();
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: impl Into<String>) {
    let reason: String = reason.into();
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

fn requested_session(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("session").cloned())
        .map(SessionId::new)
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Authorization header first, then ?token= for browsers
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    query.get("token").map(|t| t == token).unwrap_or(false)
}

fn is_origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(|origin| allowed.iter().any(|a| a == origin))
        .unwrap_or(false)
}

struct ProtocolErrorTracker {
    recent: VecDeque<Instant>,
}

impl ProtocolErrorTracker {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
        }
    }

    fn record_and_should_close(&mut self) -> bool {
        let now = Instant::now();
        self.recent.push_back(now);
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > PROTOCOL_ERROR_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        self.recent.len() > PROTOCOL_ERROR_CLOSE_THRESHOLD
    }
}
