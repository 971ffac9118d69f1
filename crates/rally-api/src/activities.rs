use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use rally_types::api::{ActivityResponse, Claims, CreateActivityRequest};
use rally_types::models::Activity;

use crate::auth::AppState;
use crate::error::{ApiError, from_core};

fn to_response(activity: Activity) -> ActivityResponse {
    ActivityResponse {
        id: activity.id,
        host_id: activity.host_id,
        title: activity.title,
        capacity: activity.capacity,
        attendee_ids: activity.attendee_ids,
        created_at: activity.created_at,
    }
}

pub async fn create_activity(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateActivityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let activity = state
        .coordinator
        .create_activity(claims.sub, &req.title, req.capacity)
        .await
        .map_err(from_core)?;

    Ok((StatusCode::CREATED, Json(to_response(activity))))
}

pub async fn get_activity(
    State(state): State<AppState>,
    Path(activity_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let activity = state
        .coordinator
        .get_activity(activity_id)
        .await
        .map_err(from_core)?;

    Ok(Json(to_response(activity)))
}
