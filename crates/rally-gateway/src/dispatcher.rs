use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use rally_types::events::{GatewayEvent, Topic};

/// Fans published events out to subscribers. Two delivery paths share the
/// same publish call:
///
/// - a broadcast channel consumed by WebSocket connections, which filter by
///   their own identity and subscription set;
/// - per-topic mpsc channels behind [`Dispatcher::subscribe`], used by
///   in-process consumers. Per-topic channels preserve publish order within
///   a topic; nothing is guaranteed across topics.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<GatewayEvent>,
    topics: RwLock<HashMap<Topic, Vec<TopicSender>>>,
    next_sub_id: AtomicU64,
}

struct TopicSender {
    id: u64,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                topics: RwLock::new(HashMap::new()),
                next_sub_id: AtomicU64::new(0),
            }),
        }
    }

    /// Raw broadcast stream, used by WebSocket connections which do their own
    /// topic filtering.
    pub fn stream(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Subscribe to one topic. The subscription unsubscribes itself when
    /// dropped, so events are never delivered into a torn-down consumer.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .write()
            .expect("topic lock poisoned")
            .entry(topic)
            .or_default()
            .push(TopicSender { id, tx });
        Subscription {
            topic,
            id,
            rx,
            inner: self.inner.clone(),
        }
    }

    /// Deliver an event to every subscriber of every topic it maps to, and to
    /// the broadcast stream. Events mapping to no topic (Ready) only reach
    /// the broadcast stream.
    pub fn publish(&self, event: GatewayEvent) {
        let topics = event.topics();
        trace!(?topics, "publishing event");

        {
            let mut registry = self.inner.topics.write().expect("topic lock poisoned");
            for topic in &topics {
                if let Some(senders) = registry.get_mut(topic) {
                    senders.retain(|sender| sender.tx.send(event.clone()).is_ok());
                    if senders.is_empty() {
                        registry.remove(topic);
                    }
                }
            }
        }

        let _ = self.inner.broadcast_tx.send(event);
    }

    #[cfg(test)]
    fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .topics
            .read()
            .expect("topic lock poisoned")
            .get(topic)
            .map_or(0, |senders| senders.len())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// A live topic subscription; dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    id: u64,
    rx: mpsc::UnboundedReceiver<GatewayEvent>,
    inner: Arc<DispatcherInner>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event on this topic; `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant for consumers draining on their own schedule.
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = match self.inner.topics.write() {
            Ok(registry) => registry,
            Err(_) => return,
        };
        if let Some(senders) = registry.get_mut(&self.topic) {
            senders.retain(|sender| sender.id != self.id);
            if senders.is_empty() {
                registry.remove(&self.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rally_types::models::{Message, MessageKind};
    use uuid::Uuid;

    fn message_event(conversation_id: Uuid, text: &str) -> GatewayEvent {
        GatewayEvent::MessageCreate {
            message: Message {
                id: Uuid::new_v4(),
                conversation_id,
                sender_id: Uuid::new_v4(),
                text: text.to_string(),
                kind: MessageKind::Text,
                metadata: serde_json::json!({}),
                created_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn delivers_only_to_matching_topic() {
        let dispatcher = Dispatcher::new();
        let conversation = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut subscribed = dispatcher.subscribe(Topic::Conversation(conversation));
        let mut unrelated = dispatcher.subscribe(Topic::Conversation(other));

        dispatcher.publish(message_event(conversation, "hello"));

        let event = subscribed.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::MessageCreate { .. }));
        assert!(unrelated.try_recv().is_none());
    }

    #[tokio::test]
    async fn preserves_order_within_a_topic() {
        let dispatcher = Dispatcher::new();
        let conversation = Uuid::new_v4();
        let mut sub = dispatcher.subscribe(Topic::Conversation(conversation));

        for i in 0..10 {
            dispatcher.publish(message_event(conversation, &format!("m{}", i)));
        }
        for i in 0..10 {
            match sub.recv().await.unwrap() {
                GatewayEvent::MessageCreate { message } => {
                    assert_eq!(message.text, format!("m{}", i));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn request_events_reach_both_participants() {
        let dispatcher = Dispatcher::new();
        let host = Uuid::new_v4();
        let requester = Uuid::new_v4();

        let mut host_sub = dispatcher.subscribe(Topic::User(host));
        let mut requester_sub = dispatcher.subscribe(Topic::User(requester));

        dispatcher.publish(GatewayEvent::RequestUpdate {
            request_id: Uuid::new_v4(),
            activity_id: Uuid::new_v4(),
            requester_id: requester,
            host_id: host,
            status: rally_types::models::RequestStatus::Approved,
            updated_at: Utc::now(),
        });

        assert!(host_sub.recv().await.is_some());
        assert!(requester_sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let dispatcher = Dispatcher::new();
        let conversation = Uuid::new_v4();
        let topic = Topic::Conversation(conversation);

        let sub = dispatcher.subscribe(topic);
        assert_eq!(dispatcher.subscriber_count(&topic), 1);
        drop(sub);
        assert_eq!(dispatcher.subscriber_count(&topic), 0);

        // Publishing into the now-empty topic is a no-op, not an error.
        dispatcher.publish(message_event(conversation, "into the void"));
    }
}
