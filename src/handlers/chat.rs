use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Local;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::db::queries;
use crate::errors::AppError;
use crate::models::{ChatMessage, User};
use crate::services::orchestrator::Session;
use crate::services::policy::ConversationPolicy;
use crate::services::tools::ToolContext;
use crate::state::AppState;

pub const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

// POST /api/chat
#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    if req.messages.is_empty() {
        return Err(AppError::BadRequest("messages must not be empty".to_string()));
    }

    let caller = resolve_caller(&state, &headers)?;
    tracing::info!(
        messages = req.messages.len(),
        authenticated = caller.is_some(),
        "chat request"
    );

    let session = Session {
        policy: ConversationPolicy::new(Local::now().date_naive()),
        tools: ToolContext { caller },
    };

    let events = state
        .orchestrator
        .stream(req.messages, session)
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok::<_, Infallible>(Event::default().data(data))
        })
        .chain(tokio_stream::once(Ok(Event::default().data("[DONE]"))));

    let sse = Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    );

    Ok(([(UI_STREAM_HEADER, "v1")], sse).into_response())
}

/// The signed-in user behind `Authorization: Bearer <session token>`.
/// Unknown or expired tokens are treated as anonymous.
fn resolve_caller(state: &AppState, headers: &HeaderMap) -> Result<Option<User>, AppError> {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    else {
        return Ok(None);
    };

    let db = state
        .db
        .lock()
        .map_err(|_| anyhow::anyhow!("database lock poisoned"))?;
    Ok(queries::get_user_by_session(&db, token)?)
}
