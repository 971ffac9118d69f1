use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationStatus, JoinRequest, Message, RequestStatus};

/// A delivery scope for realtime events. Conversation topics carry message
/// and conversation-status traffic; user topics carry the pending-queue and
/// roster traffic relevant to that user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Conversation(Uuid),
    User(Uuid),
}

/// Events sent over the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A join request was created (with its conversation)
    RequestCreate {
        request: JoinRequest,
        conversation_id: Uuid,
    },

    /// A join request was resolved by its host
    RequestUpdate {
        request_id: Uuid,
        activity_id: Uuid,
        requester_id: Uuid,
        host_id: Uuid,
        status: RequestStatus,
        updated_at: chrono::DateTime<chrono::Utc>,
    },

    /// A conversation's status or last-message marker changed
    ConversationUpdate {
        conversation_id: Uuid,
        status: ConversationStatus,
        last_message_at: chrono::DateTime<chrono::Utc>,
    },

    /// A message was appended to a conversation
    MessageCreate { message: Message },

    /// An activity's attendee set changed
    RosterUpdate {
        activity_id: Uuid,
        host_id: Uuid,
        attendee_ids: Vec<Uuid>,
    },
}

impl GatewayEvent {
    /// Topics this event should be delivered to. `Ready` is connection-local
    /// and maps to no topic.
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Self::Ready { .. } => vec![],
            Self::RequestCreate { request, .. } => vec![
                Topic::User(request.host_id),
                Topic::User(request.requester_id),
            ],
            Self::RequestUpdate {
                host_id,
                requester_id,
                ..
            } => vec![Topic::User(*host_id), Topic::User(*requester_id)],
            Self::ConversationUpdate {
                conversation_id, ..
            } => vec![Topic::Conversation(*conversation_id)],
            Self::MessageCreate { message } => {
                vec![Topic::Conversation(message.conversation_id)]
            }
            Self::RosterUpdate {
                host_id,
                attendee_ids,
                ..
            } => {
                let mut topics: Vec<Topic> =
                    attendee_ids.iter().copied().map(Topic::User).collect();
                if !attendee_ids.contains(host_id) {
                    topics.push(Topic::User(*host_id));
                }
                topics
            }
        }
    }
}

/// Commands sent FROM client TO server over the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to events for specific conversations. The authenticated
    /// user's own user topic is always delivered and needs no subscription.
    Subscribe { conversation_ids: Vec<Uuid> },
}
