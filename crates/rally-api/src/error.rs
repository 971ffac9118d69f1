use axum::Json;
use axum::http::StatusCode;
use tracing::error;

use rally_core::CoreError;
use rally_types::api::ErrorResponse;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map the core taxonomy onto HTTP. Conflict and AtCapacity share 409 but
/// keep distinct tags so clients can tell "already resolved" from "no seats
/// left". Only Transient is a server error worth logging.
pub fn from_core(err: CoreError) -> ApiError {
    let status = match &err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::Conflict(_) | CoreError::AtCapacity => StatusCode::CONFLICT,
        CoreError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let detail = match &err {
        CoreError::Transient(e) => {
            error!("transient failure: {:#}", e);
            None
        }
        other => Some(other.to_string()),
    };

    (
        status,
        Json(ErrorResponse {
            error: err.tag().to_string(),
            detail,
        }),
    )
}

pub fn internal(err: impl std::fmt::Display) -> ApiError {
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "transient".to_string(),
            detail: None,
        }),
    )
}

pub fn bad_request(detail: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "validation".to_string(),
            detail: Some(detail.to_string()),
        }),
    )
}

pub fn conflict(detail: &str) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: "conflict".to_string(),
            detail: Some(detail.to_string()),
        }),
    )
}

/// Missing or invalid credentials. Deliberately detail-free.
pub fn unauthorized() -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "unauthorized".to_string(),
            detail: None,
        }),
    )
}
