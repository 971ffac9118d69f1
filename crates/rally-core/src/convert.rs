//! Row-to-model conversions. A row that fails to parse is corrupt state, not
//! caller error, so everything here maps to `Transient`.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use rally_db::models::{ActivityRow, ConversationRow, JoinRequestRow, MessageRow};
use rally_types::models::{Activity, Conversation, JoinRequest, Message};

use crate::error::CoreError;

fn corrupt(what: &str, value: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::Transient(anyhow::anyhow!("corrupt {} '{}': {}", what, value, err))
}

pub(crate) fn parse_id(value: &str) -> Result<Uuid, CoreError> {
    value.parse().map_err(|e| corrupt("id", value, e))
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt("timestamp", value, e))
}

pub(crate) fn request_from_row(row: &JoinRequestRow) -> Result<JoinRequest, CoreError> {
    Ok(JoinRequest {
        id: parse_id(&row.id)?,
        activity_id: parse_id(&row.activity_id)?,
        requester_id: parse_id(&row.requester_id)?,
        host_id: parse_id(&row.host_id)?,
        message: row.message.clone(),
        status: row
            .status
            .parse()
            .map_err(|e| corrupt("status", &row.status, e))?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

pub(crate) fn conversation_from_row(row: &ConversationRow) -> Result<Conversation, CoreError> {
    Ok(Conversation {
        id: parse_id(&row.id)?,
        join_request_id: parse_id(&row.join_request_id)?,
        requester_id: parse_id(&row.requester_id)?,
        host_id: parse_id(&row.host_id)?,
        status: row
            .status
            .parse()
            .map_err(|e| corrupt("status", &row.status, e))?,
        last_message_at: parse_ts(&row.last_message_at)?,
    })
}

pub(crate) fn message_from_row(row: &MessageRow) -> Result<Message, CoreError> {
    Ok(Message {
        id: parse_id(&row.id)?,
        conversation_id: parse_id(&row.conversation_id)?,
        sender_id: parse_id(&row.sender_id)?,
        text: row.text.clone(),
        kind: row.kind.parse().map_err(|e| corrupt("kind", &row.kind, e))?,
        metadata: serde_json::from_str(&row.metadata)
            .map_err(|e| corrupt("metadata", &row.metadata, e))?,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub(crate) fn activity_from_row(
    row: &ActivityRow,
    roster: &[String],
) -> Result<Activity, CoreError> {
    Ok(Activity {
        id: parse_id(&row.id)?,
        host_id: parse_id(&row.host_id)?,
        title: row.title.clone(),
        capacity: row.capacity as u32,
        attendee_ids: roster
            .iter()
            .map(|id| parse_id(id))
            .collect::<Result<Vec<_>, _>>()?,
        created_at: parse_ts(&row.created_at)?,
    })
}

pub(crate) fn roster_ids(roster: &[String]) -> Result<Vec<Uuid>, CoreError> {
    roster.iter().map(|id| parse_id(id)).collect()
}
