//! SSE transport endpoints
//!
//! A client opens `GET /sse` and receives an `endpoint` event naming the URL
//! to POST its JSON-RPC messages to. Each POST is acknowledged with 202 and
//! the response is delivered on the event stream as a `message` event.

use crate::core::config::Config;
use crate::core::constants::event;
use crate::core::server::{McpServer, SERVER_VERSION};
use crate::core::service::Service;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response, Sse,
        sse::{Event, KeepAlive},
    },
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Outgoing messages buffered per session
const SESSION_BUFFER: usize = 64;

/// One connected SSE client
struct Session {
    server: Arc<McpServer>,
    sender: mpsc::Sender<String>,
}

type Sessions = Arc<RwLock<HashMap<String, Session>>>;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<dyn Service>,
    sessions: Sessions,
}

impl AppState {
    pub fn new(config: Arc<Config>, service: Arc<dyn Service>) -> Self {
        Self {
            config,
            service,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Removes the session once its event stream is dropped
struct SessionGuard {
    id: String,
    sessions: Sessions,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let id = std::mem::take(&mut self.id);
        let sessions = self.sessions.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if sessions.write().await.remove(&id).is_some() {
                    info!("🔌 SSE session {} closed", id);
                }
            });
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/sse", get(open_stream))
        .route("/messages", post(post_message))
        .route("/health", get(health_check))
        .with_state(state)
}

/// GET /sse - Open an event stream for a new session
async fn open_stream(State(state): State<AppState>) -> Response {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (sender, mut receiver) = mpsc::channel::<String>(SESSION_BUFFER);
    let server = Arc::new(McpServer::new(
        state.service.clone(),
        state.config.request.max_response_size,
    ));
    state
        .sessions
        .write()
        .await
        .insert(session_id.clone(), Session { server, sender });
    info!("📡 SSE session {} opened", session_id);

    let guard = SessionGuard {
        id: session_id.clone(),
        sessions: state.sessions.clone(),
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(
            Event::default()
                .event(event::ENDPOINT)
                .data(format!("/messages?sessionId={}", session_id)),
        );
        while let Some(message) = receiver.recv().await {
            yield Ok(Event::default().event(event::MESSAGE).data(message));
        }
    };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// POST /messages - Accept one JSON-RPC message for a session
async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let (server, sender) = match state.sessions.read().await.get(&query.session_id) {
        Some(session) => (session.server.clone(), session.sender.clone()),
        None => {
            warn!("Message for unknown session {}", query.session_id);
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("unknown session '{}'", query.session_id) })),
            )
                .into_response();
        }
    };

    debug!("📥 Message for session {}: {} bytes", query.session_id, body.len());
    tokio::spawn(async move {
        if let Some(reply) = server.handle_message(&body).await {
            if sender.send(reply).await.is_err() {
                debug!("Session closed before the reply was sent");
            }
        }
    });
    StatusCode::ACCEPTED.into_response()
}

/// GET / - Server description
async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let kind = state.service.kind();
    Json(json!({
        "name": kind.server_name(),
        "version": SERVER_VERSION,
        "transport": "sse",
        "endpoints": {
            "sse": "/sse",
            "messages": "/messages?sessionId=<id>",
            "health": "/health",
        },
    }))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "server": state.service.kind().server_name(),
        "version": SERVER_VERSION,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sessions": state.session_count().await,
    }))
}
