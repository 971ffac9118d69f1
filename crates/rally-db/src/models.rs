/// Database row types — these map directly to SQLite rows.
/// Distinct from rally-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ActivityRow {
    pub id: String,
    pub host_id: String,
    pub title: String,
    pub capacity: i64,
    pub created_at: String,
}

pub struct JoinRequestRow {
    pub id: String,
    pub activity_id: String,
    pub requester_id: String,
    pub host_id: String,
    pub message: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub join_request_id: String,
    pub requester_id: String,
    pub host_id: String,
    pub status: String,
    pub last_message_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub kind: String,
    pub metadata: String,
    pub created_at: String,
}

/// A join request joined with its conversation id, as the list endpoints
/// return it.
pub struct JoinRequestWithConversation {
    pub request: JoinRequestRow,
    pub conversation_id: String,
}
