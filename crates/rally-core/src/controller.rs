//! The write-side orchestrator. Every mutation here is a single storage
//! transaction followed by realtime fan-out; a caller never observes a join
//! request without its conversation, or an approved status without its
//! roster seat.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use rally_db::Database;
use rally_db::queries::{
    AppendOutcome, ApproveOutcome, CreateJoinRequestOutcome, DenyOutcome,
};
use rally_gateway::dispatcher::{Dispatcher, Subscription};
use rally_types::events::{GatewayEvent, Topic};
use rally_types::models::{Activity, Conversation, JoinRequest, Message};

use crate::convert;
use crate::error::CoreError;

pub struct CreatedRequest {
    pub request: JoinRequest,
    pub conversation: Conversation,
    pub seed_messages: Vec<Message>,
}

pub struct Resolved {
    pub request: JoinRequest,
    pub conversation: Conversation,
    pub message: Message,
    /// Attendee list after the roster change; approvals only.
    pub roster: Option<Vec<Uuid>>,
}

/// Coordinates the request ledger, the conversation store, and the roster,
/// and publishes the resulting records to the realtime bus.
#[derive(Clone)]
pub struct Coordinator {
    db: Arc<Database>,
    bus: Dispatcher,
}

impl Coordinator {
    pub fn new(db: Arc<Database>, bus: Dispatcher) -> Self {
        Self { db, bus }
    }

    pub fn bus(&self) -> &Dispatcher {
        &self.bus
    }

    // -- Activities --

    pub async fn create_activity(
        &self,
        host_id: Uuid,
        title: &str,
        capacity: u32,
    ) -> Result<Activity, CoreError> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(CoreError::Validation("title must not be empty".into()));
        }
        if capacity == 0 {
            return Err(CoreError::Validation("capacity must be at least 1".into()));
        }

        let db = self.db.clone();
        let host = host_id.to_string();
        let (row, roster) =
            tokio::task::spawn_blocking(move || db.create_activity(&host, &title, capacity))
                .await??;

        let activity = convert::activity_from_row(&row, &roster)?;
        info!(activity_id = %activity.id, host_id = %host_id, "activity created");
        Ok(activity)
    }

    pub async fn get_activity(&self, activity_id: Uuid) -> Result<Activity, CoreError> {
        let db = self.db.clone();
        let id = activity_id.to_string();
        let found = tokio::task::spawn_blocking(move || db.get_activity(&id)).await??;
        let (row, roster) = found
            .ok_or_else(|| CoreError::Validation(format!("unknown activity {}", activity_id)))?;
        convert::activity_from_row(&row, &roster)
    }

    // -- Join request lifecycle --

    /// Create a join request together with its conversation and the two seed
    /// messages, then notify the host's queue and both participants.
    pub async fn create_join_request(
        &self,
        activity_id: Uuid,
        requester_id: Uuid,
        message: &str,
    ) -> Result<CreatedRequest, CoreError> {
        let text = message.trim().to_string();
        if text.is_empty() {
            return Err(CoreError::Validation("message must not be empty".into()));
        }

        let db = self.db.clone();
        let activity = activity_id.to_string();
        let requester = requester_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            db.create_join_request_with_chat(&activity, &requester, &text)
        })
        .await??;

        let created = match outcome {
            CreateJoinRequestOutcome::Created(created) => created,
            CreateJoinRequestOutcome::ActivityMissing => {
                return Err(CoreError::Validation(format!(
                    "unknown activity {}",
                    activity_id
                )));
            }
            CreateJoinRequestOutcome::RequesterMissing => {
                return Err(CoreError::Validation(format!(
                    "unknown user {}",
                    requester_id
                )));
            }
            CreateJoinRequestOutcome::SelfRequest => {
                return Err(CoreError::Validation(
                    "hosts cannot request to join their own activity".into(),
                ));
            }
            CreateJoinRequestOutcome::DuplicatePending => {
                return Err(CoreError::Conflict(
                    "a pending request for this activity already exists".into(),
                ));
            }
        };

        let request = convert::request_from_row(&created.request)?;
        let conversation = convert::conversation_from_row(&created.conversation)?;
        let seed_messages = created
            .seed_messages
            .iter()
            .map(convert::message_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            request_id = %request.id,
            activity_id = %activity_id,
            requester_id = %requester_id,
            "join request created"
        );

        self.bus.publish(GatewayEvent::RequestCreate {
            request: request.clone(),
            conversation_id: conversation.id,
        });
        for message in &seed_messages {
            self.bus.publish(GatewayEvent::MessageCreate {
                message: message.clone(),
            });
        }

        Ok(CreatedRequest {
            request,
            conversation,
            seed_messages,
        })
    }

    /// Host approves: CAS on the pending status, capacity-guarded seat
    /// insert, approval message. A full roster surfaces as `AtCapacity` with
    /// the request still pending.
    pub async fn approve(&self, request_id: Uuid, actor_id: Uuid) -> Result<Resolved, CoreError> {
        let db = self.db.clone();
        let request = request_id.to_string();
        let actor = actor_id.to_string();
        let outcome =
            tokio::task::spawn_blocking(move || db.approve_request(&request, &actor)).await??;

        let resolved = match outcome {
            ApproveOutcome::Approved(resolved) => resolved,
            ApproveOutcome::RequestMissing => {
                return Err(CoreError::Validation(format!(
                    "unknown join request {}",
                    request_id
                )));
            }
            ApproveOutcome::NotHost => {
                return Err(CoreError::Forbidden(
                    "only the activity's host can resolve a request".into(),
                ));
            }
            ApproveOutcome::AlreadyResolved => {
                return Err(CoreError::Conflict("request is already resolved".into()));
            }
            ApproveOutcome::AtCapacity => return Err(CoreError::AtCapacity),
        };

        let resolved = self.finish_resolution(*resolved)?;
        info!(request_id = %request_id, "join request approved");

        self.publish_request_update(&resolved.request);
        if let Some(roster) = &resolved.roster {
            self.bus.publish(GatewayEvent::RosterUpdate {
                activity_id: resolved.request.activity_id,
                host_id: resolved.request.host_id,
                attendee_ids: roster.clone(),
            });
        }
        self.bus.publish(GatewayEvent::MessageCreate {
            message: resolved.message.clone(),
        });

        Ok(resolved)
    }

    /// Host denies: CAS on the pending status, rejection message, and the
    /// conversation goes read-only for good.
    pub async fn deny(&self, request_id: Uuid, actor_id: Uuid) -> Result<Resolved, CoreError> {
        let db = self.db.clone();
        let request = request_id.to_string();
        let actor = actor_id.to_string();
        let outcome =
            tokio::task::spawn_blocking(move || db.deny_request(&request, &actor)).await??;

        let resolved = match outcome {
            DenyOutcome::Denied(resolved) => resolved,
            DenyOutcome::RequestMissing => {
                return Err(CoreError::Validation(format!(
                    "unknown join request {}",
                    request_id
                )));
            }
            DenyOutcome::NotHost => {
                return Err(CoreError::Forbidden(
                    "only the activity's host can resolve a request".into(),
                ));
            }
            DenyOutcome::AlreadyResolved => {
                return Err(CoreError::Conflict("request is already resolved".into()));
            }
        };

        let resolved = self.finish_resolution(*resolved)?;
        info!(request_id = %request_id, "join request denied");

        self.publish_request_update(&resolved.request);
        self.bus.publish(GatewayEvent::ConversationUpdate {
            conversation_id: resolved.conversation.id,
            status: resolved.conversation.status,
            last_message_at: resolved.conversation.last_message_at,
        });
        self.bus.publish(GatewayEvent::MessageCreate {
            message: resolved.message.clone(),
        });

        Ok(resolved)
    }

    // -- Messaging --

    /// Append a text message. The caller's correlation id, if any, is echoed
    /// back in metadata so its own cache can reconcile the optimistic entry
    /// when the event comes around.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: &str,
        correlation_id: Option<&str>,
    ) -> Result<Message, CoreError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(CoreError::Validation("message must not be empty".into()));
        }

        let metadata = match correlation_id {
            Some(correlation) => {
                serde_json::json!({ "correlation_id": correlation }).to_string()
            }
            None => "{}".to_string(),
        };

        let db = self.db.clone();
        let conversation = conversation_id.to_string();
        let sender = sender_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            db.append_message(&conversation, &sender, &text, "text", &metadata)
        })
        .await??;

        let message = match outcome {
            AppendOutcome::Appended { message, .. } => convert::message_from_row(&message)?,
            AppendOutcome::ConversationMissing => {
                return Err(CoreError::Validation(format!(
                    "unknown conversation {}",
                    conversation_id
                )));
            }
            AppendOutcome::NotParticipant => {
                return Err(CoreError::Forbidden(
                    "only participants can write to this conversation".into(),
                ));
            }
            AppendOutcome::ReadOnly => {
                return Err(CoreError::Forbidden("conversation is read-only".into()));
            }
        };

        debug!(message_id = %message.id, conversation_id = %conversation_id, "message sent");
        self.bus.publish(GatewayEvent::MessageCreate {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Ascending (created_at, id); `before` pages backwards from the oldest
    /// already-loaded timestamp.
    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        actor_id: Uuid,
        limit: u32,
        before: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<Message>, CoreError> {
        let db = self.db.clone();
        let conversation = conversation_id.to_string();
        let limit = limit.min(200);
        let cursor = before
            .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));

        let (conversation_row, rows) = tokio::task::spawn_blocking(move || {
            let conversation_row = db.get_conversation(&conversation)?;
            let rows = db.get_messages(&conversation, limit, cursor.as_deref())?;
            anyhow::Ok((conversation_row, rows))
        })
        .await??;

        let conversation_row = conversation_row.ok_or_else(|| {
            CoreError::Validation(format!("unknown conversation {}", conversation_id))
        })?;
        let conversation = convert::conversation_from_row(&conversation_row)?;
        if !conversation.is_participant(actor_id) {
            return Err(CoreError::Forbidden(
                "only participants can read this conversation".into(),
            ));
        }

        // Storage hands back the newest page first; flip to display order.
        let mut messages = rows
            .iter()
            .map(convert::message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    // -- Queues --

    pub async fn list_pending_for_host(
        &self,
        host_id: Uuid,
    ) -> Result<Vec<(JoinRequest, Uuid)>, CoreError> {
        let db = self.db.clone();
        let host = host_id.to_string();
        let rows = tokio::task::spawn_blocking(move || db.list_pending_for_host(&host)).await??;
        rows.iter()
            .map(|row| {
                Ok((
                    convert::request_from_row(&row.request)?,
                    convert::parse_id(&row.conversation_id)?,
                ))
            })
            .collect()
    }

    pub async fn list_for_requester(
        &self,
        requester_id: Uuid,
    ) -> Result<Vec<(JoinRequest, Uuid)>, CoreError> {
        let db = self.db.clone();
        let requester = requester_id.to_string();
        let rows = tokio::task::spawn_blocking(move || db.list_for_requester(&requester)).await??;
        rows.iter()
            .map(|row| {
                Ok((
                    convert::request_from_row(&row.request)?,
                    convert::parse_id(&row.conversation_id)?,
                ))
            })
            .collect()
    }

    // -- Subscriptions --

    /// Message and conversation-status events for one conversation. The
    /// returned guard unsubscribes when dropped.
    pub fn subscribe_to_conversation(&self, conversation_id: Uuid) -> Subscription {
        self.bus.subscribe(Topic::Conversation(conversation_id))
    }

    /// Pending-queue and roster events relevant to one user.
    pub fn subscribe_to_user_events(&self, user_id: Uuid) -> Subscription {
        self.bus.subscribe(Topic::User(user_id))
    }

    // -- Internal --

    fn finish_resolution(
        &self,
        resolved: rally_db::queries::ResolvedRequest,
    ) -> Result<Resolved, CoreError> {
        Ok(Resolved {
            request: convert::request_from_row(&resolved.request)?,
            conversation: convert::conversation_from_row(&resolved.conversation)?,
            message: convert::message_from_row(&resolved.message)?,
            roster: resolved
                .roster
                .as_deref()
                .map(convert::roster_ids)
                .transpose()?,
        })
    }

    fn publish_request_update(&self, request: &JoinRequest) {
        self.bus.publish(GatewayEvent::RequestUpdate {
            request_id: request.id,
            activity_id: request.activity_id,
            requester_id: request.requester_id,
            host_id: request.host_id,
            status: request.status,
            updated_at: request.updated_at,
        });
    }
}
