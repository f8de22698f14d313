//! HTTP server implementation using Axum.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::io;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::session::{default_env, SESSION_USER};
use crate::state::AppState;
use crate::store::{CommandRecord, FileNode, NewSession, SessionRecord};
use crate::terminal;

/// Directory recorded for sessions created over REST, before any sandbox exists.
const REST_SESSION_DIRECTORY: &str = "/home/user";

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Session records
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/commands", get(command_history))
        .route("/sessions/:id/files", get(file_tree))
        // Terminal socket
        .route("/ws", get(ws_upgrade))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener until the server stops.
pub async fn run_server(listener: TcpListener, state: AppState) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!("Starting HTTP server on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| terminal::handle_socket(socket, state))
}

async fn create_session(State(state): State<AppState>) -> Json<SessionRecord> {
    let mut env = default_env(std::path::Path::new(REST_SESSION_DIRECTORY));
    env.insert("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string());

    let record = state
        .store
        .create_session(NewSession {
            id: None,
            user_id: Some(SESSION_USER.to_string()),
            current_directory: REST_SESSION_DIRECTORY.to_string(),
            environment_vars: env,
        })
        .await;
    state.store.seed_file_tree(&record.id).await;

    info!(session_id = %record.id, "Created session");
    Json(record)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    state
        .store
        .get_session(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Session not found"))
}

async fn command_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<CommandRecord>> {
    let limit = query.limit.unwrap_or(state.history_limit);
    Json(state.store.command_history(&id, limit).await)
}

async fn file_tree(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<FileNode>> {
    Json(state.store.file_tree(&id).await)
}
