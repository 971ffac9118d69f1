//! Per-client projection of server state: chat transcripts, the
//! pending-request queue, and roster views. Local optimistic writes are
//! tagged with a correlation id and reconciled against the first matching
//! confirmation — the direct response or the realtime echo, whichever lands
//! first — after which the other arrival is a no-op by id.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use rally_types::events::GatewayEvent;
use rally_types::models::{
    ConversationStatus, JoinRequest, Message, MessageKind, RequestStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Applied locally, not yet confirmed by the server.
    Pending,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub message: Message,
    pub state: DeliveryState,
    pub correlation_id: Option<String>,
}

#[derive(Default)]
struct Transcript {
    /// Kept sorted by (created_at, id); pending entries sort on their local
    /// timestamps until confirmed.
    entries: Vec<ChatEntry>,
    /// Server-assigned ids already applied; re-delivery of any of these is a
    /// no-op.
    seen: HashSet<Uuid>,
}

impl Transcript {
    fn insert_sorted(&mut self, entry: ChatEntry) {
        let key = (entry.message.created_at, entry.message.id);
        let idx = self
            .entries
            .partition_point(|e| (e.message.created_at, e.message.id) <= key);
        self.entries.insert(idx, entry);
    }

    fn take_pending(&mut self, correlation_id: &str) -> Option<ChatEntry> {
        let idx = self.entries.iter().position(|e| {
            e.state == DeliveryState::Pending
                && e.correlation_id.as_deref() == Some(correlation_id)
        })?;
        Some(self.entries.remove(idx))
    }
}

struct RequestEntry {
    request: JoinRequest,
    conversation_id: Uuid,
}

pub struct ClientStateCache {
    user_id: Uuid,
    transcripts: HashMap<Uuid, Transcript>,
    requests: HashMap<Uuid, RequestEntry>,
    conversation_status: HashMap<Uuid, ConversationStatus>,
    rosters: HashMap<Uuid, Vec<Uuid>>,
}

impl ClientStateCache {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            transcripts: HashMap::new(),
            requests: HashMap::new(),
            conversation_status: HashMap::new(),
            rosters: HashMap::new(),
        }
    }

    // -- Optimistic message path --

    /// Show a just-typed message immediately. The entry carries a
    /// client-generated correlation id and a placeholder id; the server
    /// record replaces it on confirmation.
    pub fn stage_message(
        &mut self,
        conversation_id: Uuid,
        correlation_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) {
        let entry = ChatEntry {
            message: Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: self.user_id,
                text: text.to_string(),
                kind: MessageKind::Text,
                metadata: serde_json::json!({ "correlation_id": correlation_id }),
                created_at: now,
            },
            state: DeliveryState::Pending,
            correlation_id: Some(correlation_id.to_string()),
        };
        self.transcripts
            .entry(conversation_id)
            .or_default()
            .insert_sorted(entry);
    }

    /// The direct RPC response for a staged message. If the realtime echo
    /// already resolved the entry, this is a duplicate and a no-op.
    /// Returns true when the cache changed.
    pub fn confirm_message(&mut self, correlation_id: &str, message: Message) -> bool {
        self.reconcile(message, Some(correlation_id))
    }

    /// The originating action failed: remove the staged entry.
    pub fn fail_message(&mut self, conversation_id: Uuid, correlation_id: &str) -> bool {
        match self.transcripts.get_mut(&conversation_id) {
            Some(transcript) => transcript.take_pending(correlation_id).is_some(),
            None => false,
        }
    }

    // -- Event application --

    /// Apply a pushed event. Safe to call with the same event any number of
    /// times; every path is idempotent.
    pub fn apply_event(&mut self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Ready { .. } => {}
            GatewayEvent::MessageCreate { message } => {
                let correlation = message.correlation_id().map(str::to_string);
                self.reconcile(message.clone(), correlation.as_deref());
            }
            GatewayEvent::RequestCreate {
                request,
                conversation_id,
            } => {
                self.insert_request(request.clone(), *conversation_id);
            }
            GatewayEvent::RequestUpdate {
                request_id,
                status,
                updated_at,
                ..
            } => {
                if let Some(entry) = self.requests.get_mut(request_id) {
                    if entry.request.updated_at < *updated_at {
                        entry.request.status = *status;
                        entry.request.updated_at = *updated_at;
                    }
                }
            }
            GatewayEvent::ConversationUpdate {
                conversation_id,
                status,
                ..
            } => {
                self.conversation_status.insert(*conversation_id, *status);
            }
            GatewayEvent::RosterUpdate {
                activity_id,
                attendee_ids,
                ..
            } => {
                self.rosters.insert(*activity_id, attendee_ids.clone());
            }
        }
    }

    /// Seed a request from a fetched list (or the create response).
    /// Idempotent by id; an older snapshot never overwrites a newer one.
    pub fn insert_request(&mut self, request: JoinRequest, conversation_id: Uuid) {
        match self.requests.get_mut(&request.id) {
            Some(entry) => {
                if entry.request.updated_at < request.updated_at {
                    entry.request = request;
                }
            }
            None => {
                self.requests.insert(
                    request.id,
                    RequestEntry {
                        request,
                        conversation_id,
                    },
                );
            }
        }
    }

    /// Seed a transcript from a fetched message page. Duplicates (already
    /// pushed while the fetch was in flight) are dropped by id.
    pub fn insert_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            let correlation = message.correlation_id().map(str::to_string);
            self.reconcile(message, correlation.as_deref());
        }
    }

    // -- Views --

    /// Transcript in (created_at, id) order, pending entries included.
    pub fn messages(&self, conversation_id: Uuid) -> &[ChatEntry] {
        self.transcripts
            .get(&conversation_id)
            .map(|t| t.entries.as_slice())
            .unwrap_or(&[])
    }

    /// The host-side queue: requests awaiting this user's decision.
    pub fn pending_queue(&self) -> Vec<&JoinRequest> {
        let mut queue: Vec<&JoinRequest> = self
            .requests
            .values()
            .filter(|e| {
                e.request.host_id == self.user_id && e.request.status == RequestStatus::Pending
            })
            .map(|e| &e.request)
            .collect();
        queue.sort_by_key(|r| (r.created_at, r.id));
        queue
    }

    /// Requests this user has made, newest first.
    pub fn my_requests(&self) -> Vec<&JoinRequest> {
        let mut list: Vec<&JoinRequest> = self
            .requests
            .values()
            .filter(|e| e.request.requester_id == self.user_id)
            .map(|e| &e.request)
            .collect();
        list.sort_by_key(|r| std::cmp::Reverse((r.created_at, r.id)));
        list
    }

    pub fn conversation_for_request(&self, request_id: Uuid) -> Option<Uuid> {
        self.requests.get(&request_id).map(|e| e.conversation_id)
    }

    pub fn conversation_status(&self, conversation_id: Uuid) -> Option<ConversationStatus> {
        self.conversation_status.get(&conversation_id).copied()
    }

    pub fn roster(&self, activity_id: Uuid) -> Option<&[Uuid]> {
        self.rosters.get(&activity_id).map(|r| r.as_slice())
    }

    // -- Internal --

    /// Single reconciliation path for confirmed messages, whichever door they
    /// come through. Duplicate by id → no-op. Matching staged entry →
    /// replaced in place. Otherwise → fresh insert.
    fn reconcile(&mut self, message: Message, correlation_id: Option<&str>) -> bool {
        let transcript = self.transcripts.entry(message.conversation_id).or_default();
        if transcript.seen.contains(&message.id) {
            return false;
        }
        if let Some(correlation) = correlation_id {
            transcript.take_pending(correlation);
        }
        transcript.seen.insert(message.id);
        let correlation_id = correlation_id.map(str::to_string);
        transcript.insert_sorted(ChatEntry {
            message,
            state: DeliveryState::Confirmed,
            correlation_id,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(conversation_id: Uuid, text: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: Uuid::new_v4(),
            text: text.to_string(),
            kind: MessageKind::Text,
            metadata: serde_json::json!({}),
            created_at: at,
        }
    }

    fn with_correlation(mut message: Message, correlation_id: &str) -> Message {
        message.metadata = serde_json::json!({ "correlation_id": correlation_id });
        message
    }

    fn request(host: Uuid, requester: Uuid, at: DateTime<Utc>) -> JoinRequest {
        JoinRequest {
            id: Uuid::new_v4(),
            activity_id: Uuid::new_v4(),
            requester_id: requester,
            host_id: host,
            message: "hi".into(),
            status: RequestStatus::Pending,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn duplicate_delivery_yields_one_visible_message() {
        let me = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let mut cache = ClientStateCache::new(me);

        let event = GatewayEvent::MessageCreate {
            message: message(conversation, "hello", Utc::now()),
        };
        cache.apply_event(&event);
        cache.apply_event(&event);

        assert_eq!(cache.messages(conversation).len(), 1);
    }

    #[test]
    fn direct_response_confirms_the_staged_entry() {
        let me = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let mut cache = ClientStateCache::new(me);
        let now = Utc::now();

        cache.stage_message(conversation, "corr-1", "on my way", now);
        assert_eq!(cache.messages(conversation).len(), 1);
        assert_eq!(
            cache.messages(conversation)[0].state,
            DeliveryState::Pending
        );

        let confirmed = with_correlation(message(conversation, "on my way", now), "corr-1");
        assert!(cache.confirm_message("corr-1", confirmed.clone()));

        let entries = cache.messages(conversation);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, DeliveryState::Confirmed);
        assert_eq!(entries[0].message.id, confirmed.id);

        // The realtime echo of the same record is now a duplicate.
        cache.apply_event(&GatewayEvent::MessageCreate { message: confirmed });
        assert_eq!(cache.messages(conversation).len(), 1);
    }

    #[test]
    fn echo_before_response_still_resolves_once() {
        let me = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let mut cache = ClientStateCache::new(me);
        let now = Utc::now();

        cache.stage_message(conversation, "corr-2", "joining late", now);
        let confirmed = with_correlation(message(conversation, "joining late", now), "corr-2");

        // Echo arrives first and replaces the staged entry by correlation id.
        cache.apply_event(&GatewayEvent::MessageCreate {
            message: confirmed.clone(),
        });
        assert_eq!(cache.messages(conversation).len(), 1);
        assert_eq!(
            cache.messages(conversation)[0].state,
            DeliveryState::Confirmed
        );

        // The direct response is then a duplicate no-op by id.
        assert!(!cache.confirm_message("corr-2", confirmed));
        assert_eq!(cache.messages(conversation).len(), 1);
    }

    #[test]
    fn failed_send_rolls_the_entry_back() {
        let me = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let mut cache = ClientStateCache::new(me);

        cache.stage_message(conversation, "corr-3", "oops", Utc::now());
        assert!(cache.fail_message(conversation, "corr-3"));
        assert!(cache.messages(conversation).is_empty());
        // Double rollback is a no-op.
        assert!(!cache.fail_message(conversation, "corr-3"));
    }

    #[test]
    fn transcript_orders_by_timestamp_regardless_of_arrival() {
        let me = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let mut cache = ClientStateCache::new(me);
        let base = Utc::now();

        let later = message(conversation, "second", base + Duration::seconds(2));
        let earlier = message(conversation, "first", base);
        cache.apply_event(&GatewayEvent::MessageCreate { message: later });
        cache.apply_event(&GatewayEvent::MessageCreate { message: earlier });

        let texts: Vec<&str> = cache
            .messages(conversation)
            .iter()
            .map(|e| e.message.text.as_str())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn pending_queue_follows_request_lifecycle() {
        let host = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let mut cache = ClientStateCache::new(host);
        let now = Utc::now();

        let req = request(host, requester, now);
        let conversation = Uuid::new_v4();
        let create = GatewayEvent::RequestCreate {
            request: req.clone(),
            conversation_id: conversation,
        };
        cache.apply_event(&create);
        cache.apply_event(&create); // re-delivery
        assert_eq!(cache.pending_queue().len(), 1);
        assert_eq!(cache.conversation_for_request(req.id), Some(conversation));

        let update = GatewayEvent::RequestUpdate {
            request_id: req.id,
            activity_id: req.activity_id,
            requester_id: requester,
            host_id: host,
            status: RequestStatus::Approved,
            updated_at: now + Duration::seconds(1),
        };
        cache.apply_event(&update);
        cache.apply_event(&update); // re-delivery
        assert!(cache.pending_queue().is_empty());
    }

    #[test]
    fn stale_request_update_does_not_regress_status() {
        let host = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let mut cache = ClientStateCache::new(requester);
        let now = Utc::now();

        let mut req = request(host, requester, now);
        req.status = RequestStatus::Approved;
        req.updated_at = now + Duration::seconds(5);
        cache.insert_request(req.clone(), Uuid::new_v4());

        // A late-arriving older update must not win.
        cache.apply_event(&GatewayEvent::RequestUpdate {
            request_id: req.id,
            activity_id: req.activity_id,
            requester_id: requester,
            host_id: host,
            status: RequestStatus::Pending,
            updated_at: now,
        });
        assert_eq!(cache.my_requests()[0].status, RequestStatus::Approved);
    }

    #[test]
    fn roster_updates_replace_idempotently() {
        let me = Uuid::new_v4();
        let activity = Uuid::new_v4();
        let host = Uuid::new_v4();
        let mut cache = ClientStateCache::new(me);

        let attendees = vec![host, me];
        let event = GatewayEvent::RosterUpdate {
            activity_id: activity,
            host_id: host,
            attendee_ids: attendees.clone(),
        };
        cache.apply_event(&event);
        cache.apply_event(&event);

        assert_eq!(cache.roster(activity), Some(attendees.as_slice()));
    }
}
