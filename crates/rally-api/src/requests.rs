use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use rally_types::api::{
    Claims, CreateJoinRequestRequest, CreateJoinRequestResponse, JoinRequestView,
};

use crate::auth::AppState;
use crate::error::{ApiError, from_core};

pub async fn create_join_request(
    State(state): State<AppState>,
    Path(activity_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateJoinRequestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state
        .coordinator
        .create_join_request(activity_id, claims.sub, &req.message)
        .await
        .map_err(from_core)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJoinRequestResponse {
            join_request_id: created.request.id,
            conversation_id: created.conversation.id,
        }),
    ))
}

pub async fn approve(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .coordinator
        .approve(request_id, claims.sub)
        .await
        .map_err(from_core)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deny(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .coordinator
        .deny(request_id, claims.sub)
        .await
        .map_err(from_core)?;
    Ok(StatusCode::NO_CONTENT)
}

/// The host's queue: requests awaiting their decision.
pub async fn list_pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .coordinator
        .list_pending_for_host(claims.sub)
        .await
        .map_err(from_core)?;

    let views: Vec<JoinRequestView> = rows
        .into_iter()
        .map(|(request, conversation_id)| JoinRequestView {
            request,
            conversation_id,
        })
        .collect();
    Ok(Json(views))
}

/// Every request the caller has made, newest first.
pub async fn list_mine(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .coordinator
        .list_for_requester(claims.sub)
        .await
        .map_err(from_core)?;

    let views: Vec<JoinRequestView> = rows
        .into_iter()
        .map(|(request, conversation_id)| JoinRequestView {
            request,
            conversation_id,
        })
        .collect();
    Ok(Json(views))
}
