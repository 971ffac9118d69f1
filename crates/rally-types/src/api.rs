use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{JoinRequest, Message};

// -- JWT Claims --

/// JWT claims shared between rally-api (REST middleware) and rally-gateway
/// (WebSocket authentication). Canonical definition lives here in rally-types
/// to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Activities --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateActivityRequest {
    pub title: String,
    pub capacity: u32,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub id: Uuid,
    pub host_id: Uuid,
    pub title: String,
    pub capacity: u32,
    pub attendee_ids: Vec<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// -- Join requests --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateJoinRequestRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CreateJoinRequestResponse {
    pub join_request_id: Uuid,
    pub conversation_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct JoinRequestView {
    #[serde(flatten)]
    pub request: JoinRequest,
    pub conversation_id: Uuid,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
    /// Client-generated id for reconciling the optimistic local entry with
    /// the confirmed record. Echoed back in message metadata.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    #[serde(flatten)]
    pub message: Message,
}

// -- Errors --

/// Uniform error body; `error` is a stable machine-readable tag
/// ("validation", "forbidden", "conflict", "at_capacity", "transient",
/// plus "unauthorized" at the auth boundary).
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
