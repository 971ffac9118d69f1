use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use rally_types::api::Claims;
use rally_types::events::{GatewayCommand, GatewayEvent, Topic};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, Ready, then the
/// event loop. The connection always receives its user topic; conversation
/// topics follow the client's Subscribe command.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(
            serde_json::to_string(&ready).unwrap().into(),
        ))
        .await
        .is_err()
    {
        return;
    }

    let mut broadcast_rx = dispatcher.stream();

    // Per-connection conversation subscriptions (shared between send and recv
    // tasks).
    let subscribed: Arc<RwLock<HashSet<Uuid>>> = Arc::new(RwLock::new(HashSet::new()));
    let send_subscriptions = subscribed.clone();
    let recv_subscriptions = subscribed.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward filtered broadcasts -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    {
                        let subs = send_subscriptions.read()
                            .expect("subscription lock poisoned");
                        if !wants_event(&event, user_id, &subs) {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(GatewayCommand::Identify { .. }) => {} // Already handled
                    Ok(GatewayCommand::Subscribe { conversation_ids }) => {
                        info!(
                            "{} ({}) subscribing to {} conversations",
                            username_recv,
                            user_id,
                            conversation_ids.len()
                        );
                        let mut subs = recv_subscriptions
                            .write()
                            .expect("subscription lock poisoned");
                        *subs = conversation_ids.into_iter().collect();
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// A connection sees an event when one of its topics matches: the
/// authenticated user's own topic, or a conversation it subscribed to.
/// Topic-less events (Ready) are connection-local and never forwarded.
fn wants_event(event: &GatewayEvent, user_id: Uuid, subscribed: &HashSet<Uuid>) -> bool {
    event.topics().iter().any(|topic| match topic {
        Topic::User(id) => *id == user_id,
        Topic::Conversation(id) => subscribed.contains(id),
    })
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rally_types::models::RequestStatus;

    #[test]
    fn user_events_reach_only_their_user() {
        let host = Uuid::new_v4();
        let requester = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let event = GatewayEvent::RequestUpdate {
            request_id: Uuid::new_v4(),
            activity_id: Uuid::new_v4(),
            requester_id: requester,
            host_id: host,
            status: RequestStatus::Denied,
            updated_at: Utc::now(),
        };

        let no_subs = HashSet::new();
        assert!(wants_event(&event, host, &no_subs));
        assert!(wants_event(&event, requester, &no_subs));
        assert!(!wants_event(&event, stranger, &no_subs));
    }

    #[test]
    fn conversation_events_require_a_subscription() {
        let conversation = Uuid::new_v4();
        let viewer = Uuid::new_v4();
        let event = GatewayEvent::ConversationUpdate {
            conversation_id: conversation,
            status: rally_types::models::ConversationStatus::ReadOnly,
            last_message_at: Utc::now(),
        };

        let mut subs = HashSet::new();
        assert!(!wants_event(&event, viewer, &subs));
        subs.insert(conversation);
        assert!(wants_event(&event, viewer, &subs));
    }

    #[test]
    fn ready_is_never_forwarded() {
        let user = Uuid::new_v4();
        let event = GatewayEvent::Ready {
            user_id: user,
            username: "rei".into(),
        };
        assert!(!wants_event(&event, user, &HashSet::new()));
    }
}
