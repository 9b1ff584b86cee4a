//! Session routes: creation, listing and history.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chatrelay_store::Turn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session))
}

#[derive(Debug, Default, Deserialize)]
struct CreateSession {
    user_id: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    user_id: Option<String>,
}

/// One turn of session history as returned to the client.
#[derive(Debug, Serialize)]
struct TurnView {
    role: String,
    content: String,
    provider: Option<String>,
    model: Option<String>,
    incomplete: bool,
    created_at: String,
}

impl From<Turn> for TurnView {
    fn from(turn: Turn) -> Self {
        Self {
            role: turn.role.to_string(),
            content: turn.content,
            provider: turn.provider,
            model: turn.model,
            incomplete: turn.incomplete,
            created_at: rfc3339(turn.created_at),
        }
    }
}

fn rfc3339(millis: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// POST /sessions: the body is optional; an unknown or absent user id gets a new user.
async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let payload: CreateSession = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSession::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid body: {}", e)))?
    };

    let user_id = payload.user_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let session = state.store.create_session(user_id, payload.title.as_deref())?;

    Ok(Json(json!({
        "session_id": session.id,
        "user_id": session.user_id,
    })))
}

/// GET /sessions?user_id=
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = query
        .user_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("user_id is required"))?;

    let sessions: Vec<serde_json::Value> = state
        .store
        .list_sessions(&user_id)?
        .into_iter()
        .map(|s| json!({ "id": s.id, "title": s.title, "created_at": rfc3339(s.created_at) }))
        .collect();

    Ok(Json(json!(sessions)))
}

/// GET /sessions/{id}: turns in append order.
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TurnView>>, ApiError> {
    let turns = state.store.messages(&id)?;
    Ok(Json(turns.into_iter().map(TurnView::from).collect()))
}
