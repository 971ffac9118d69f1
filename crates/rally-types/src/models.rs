use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// An activity someone hosts and others request to join.
/// The attendee set holds approved requesters, bounded by `capacity`; the
/// host is implied and never occupies a seat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub host_id: Uuid,
    pub title: String,
    pub capacity: u32,
    pub attendee_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a join request. `Approved` and `Denied` are terminal;
/// the only writer of the transition is the activity's host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    ReadOnly,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ReadOnly => "read_only",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "read_only" => Ok(Self::ReadOnly),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// What a message *is*, not just who sent it. The non-`text` kinds are
/// system-authored and remain appendable after a conversation goes read-only,
/// since they announce the transition itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
    JoinRequest,
    Approval,
    Rejection,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::JoinRequest => "join_request",
            Self::Approval => "approval",
            Self::Rejection => "rejection",
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "system" => Ok(Self::System),
            "join_request" => Ok(Self::JoinRequest),
            "approval" => Ok(Self::Approval),
            "rejection" => Ok(Self::Rejection),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: Uuid,
    pub activity_id: Uuid,
    pub requester_id: Uuid,
    /// Denormalized from the activity at creation time.
    pub host_id: Uuid,
    pub message: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The 1:1 thread permanently linked to exactly one join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub join_request_id: Uuid,
    pub requester_id: Uuid,
    pub host_id: Uuid,
    pub status: ConversationStatus,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        user_id == self.requester_id || user_id == self.host_id
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub kind: MessageKind,
    /// Free-form. Carries the client correlation id under "correlation_id"
    /// when the sender supplied one.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Correlation id the sending client tagged this message with, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get("correlation_id").and_then(|v| v.as_str())
    }
}
