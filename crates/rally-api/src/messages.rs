use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use rally_types::api::{Claims, MessageResponse, SendMessageRequest};

use crate::auth::AppState;
use crate::error::{ApiError, bad_request, from_core};

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor-based pagination — pass the `created_at` timestamp of the
    /// oldest message from the previous page to fetch older messages.
    pub before: Option<String>,
}

fn default_limit() -> u32 {
    50
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .coordinator
        .send_message(
            conversation_id,
            claims.sub,
            &req.text,
            req.correlation_id.as_deref(),
        )
        .await
        .map_err(from_core)?;

    Ok((StatusCode::CREATED, Json(MessageResponse { message })))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let before = match &query.before {
        Some(raw) => Some(
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|_| bad_request("before must be an RFC 3339 timestamp"))?,
        ),
        None => None,
    };

    let messages = state
        .coordinator
        .list_messages(conversation_id, claims.sub, query.limit, before)
        .await
        .map_err(from_core)?;

    let views: Vec<MessageResponse> = messages
        .into_iter()
        .map(|message| MessageResponse { message })
        .collect();
    Ok(Json(views))
}
