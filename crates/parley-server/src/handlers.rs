use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use parley_core::ids::{SessionId, UserId};
use parley_store::events::EventPreview;
use parley_store::sessions::SessionRow;

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub agent_key: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsQuery {
    pub agent_key: Option<String>,
}

/// A session as it appears in the listing, with its newest event attached.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    #[serde(flatten)]
    session: SessionRow,
    last_event: Option<EventPreview>,
}

/// Resolve the bearer token to a user, or refuse the request.
async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    state
        .auth
        .authenticate(token)
        .await
        .ok_or(ApiError::Unauthorized)
}

/// GET /api/chat/agents, the one endpoint that answers without auth.
pub async fn list_agents(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "agents": state.catalog.agents() }))
}

/// GET /api/chat/sessions?agentKey=
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers).await?;

    let sessions = state
        .sessions
        .list_for_owner(&user, query.agent_key.as_deref())?;
    let mut previews = state.events.previews_for_owner(&user)?;

    let summaries: Vec<SessionSummary> = sessions
        .into_iter()
        .map(|session| {
            let last_event = previews.remove(session.id.as_str());
            SessionSummary {
                session,
                last_event,
            }
        })
        .collect();

    Ok(Json(json!({ "sessions": summaries })))
}

/// POST /api/chat/sessions
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers).await?;

    let key = req
        .agent_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::Validation("agentKey is required".to_string()))?;

    // Creation checks the catalog eagerly; replies later tolerate keys that
    // have since dropped out of it.
    let agent = state
        .catalog
        .get(key)
        .ok_or_else(|| ApiError::NotFound(format!("agent {key}")))?;

    let title = req
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let session = state.sessions.create(&user, &agent.key, title)?;
    Ok(Json(json!({ "session": session })))
}

/// GET /api/chat/sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers).await?;

    let session_id = SessionId::from_raw(session_id);
    let session = state.sessions.get(&session_id, &user)?;
    let events = state.events.list_all(&session_id)?;

    Ok(Json(json!({ "session": session, "events": events })))
}

/// POST /api/chat/sessions/{id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let user = require_user(&state, &headers).await?;

    let session_id = SessionId::from_raw(session_id);
    let content = req.content.unwrap_or_default();
    let outcome = state
        .pipeline
        .send_message(&user, &session_id, &content)
        .await?;

    Ok(Json(
        json!({ "events": [outcome.user_event, outcome.assistant_event] }),
    ))
}

/// DELETE /api/chat/sessions/{id}
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = require_user(&state, &headers).await?;

    let session_id = SessionId::from_raw(session_id);
    state.sessions.delete(&session_id, &user)?;
    Ok(StatusCode::NO_CONTENT)
}
