use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{ClientFrame, GatewayEvent};
use parley_types::models::{DeliveryStatus, Message as ChatMessage};

use crate::dispatcher::{DeliveryOutcome, Dispatcher};
use crate::error::RelayError;
use crate::registry::{ConnectionHandle, SessionMessage};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive one pre-authenticated WebSocket connection through its lifetime.
/// The JWT was already validated at the HTTP upgrade layer, so a session
/// that reaches this point owns a resolved `user_id`.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} connected to gateway", user_id);

    // Tell the client its session is live.
    let ready = GatewayEvent::Ready { user_id };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let (handle, mut session_rx) = ConnectionHandle::new(user_id);
    let conn_id = handle.conn_id;
    let own_handle = handle.clone();

    // Last-connection-wins: a reconnecting user supersedes their previous
    // connection. The superseded session is told to close and is otherwise
    // left to tear itself down; its stale conn_id makes its cleanup a no-op.
    if let Some(old) = dispatcher.registry().register(handle) {
        info!("{} reconnected, superseding {}", user_id, old.conn_id);
        let _ = old.push(SessionMessage::Superseded);
    }

    // Durable presence flip, then fan the update out to connected clients.
    set_presence_online(&db, user_id).await;
    dispatcher.broadcast(GatewayEvent::PresenceUpdate {
        user_id,
        online: true,
    });

    let mut broadcast_rx = dispatcher.subscribe();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Send task: forward targeted messages + broadcasts to the socket, with
    // heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = session_rx.recv() => {
                    match result {
                        Some(SessionMessage::Event(event)) => {
                            let text = serde_json::to_string(&event).unwrap();
                            if sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(SessionMessage::Superseded) => {
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    }
                }
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

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
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Receive task: decode inbound frames and drive persist + dispatch.
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let frame = match parse_frame(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            // Malformed frames are skipped, not fatal.
                            warn!(
                                "{} {} -- raw: {}",
                                user_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                            continue;
                        }
                    };

                    let ClientFrame::Send {
                        recipient_id,
                        content,
                    } = frame;

                    match relay_frame(&dispatcher_recv, &db_recv, user_id, recipient_id, content)
                        .await
                    {
                        Ok(outcome) => {
                            if outcome == DeliveryOutcome::RecipientOffline {
                                info!("{} -> {}: recipient offline, stored only", user_id, recipient_id);
                            }
                        }
                        Err(e) => {
                            // The message was not persisted. The sender must
                            // hear about it while the transport still works;
                            // if it doesn't, end the session.
                            error!("{} -> {}: {}", user_id, recipient_id, e);
                            let event = GatewayEvent::Error {
                                code: "store_write_failed".into(),
                                message: "message could not be persisted".into(),
                            };
                            if own_handle.push(SessionMessage::Event(event)).is_err() {
                                break;
                            }
                        }
                    }
                }
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

    // Single cleanup site for every exit path: transport error, protocol
    // error, heartbeat timeout, or graceful close. A superseded session's
    // conn_id no longer owns the entry, so only the current owner flips
    // presence offline.
    if dispatcher.registry().unregister(user_id, conn_id) {
        set_presence_offline(&db, user_id).await;
        dispatcher.broadcast(GatewayEvent::PresenceUpdate {
            user_id,
            online: false,
        });
    }

    info!("{} disconnected from gateway", user_id);
}

/// Decode a single inbound text frame.
pub fn parse_frame(text: &str) -> Result<ClientFrame, RelayError> {
    serde_json::from_str(text).map_err(|e| RelayError::MalformedFrame(e.to_string()))
}

/// Relay one valid inbound frame: durably append, then attempt delivery.
/// Dispatch failure never invalidates persistence — by the time delivery is
/// attempted the message is already in the store, and an offline or broken
/// recipient catches up through history.
pub async fn relay_frame(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    sender_id: Uuid,
    recipient_id: Uuid,
    content: String,
) -> Result<DeliveryOutcome, RelayError> {
    let row = {
        let db = db.clone();
        let sender = sender_id.to_string();
        let recipient = recipient_id.to_string();
        tokio::task::spawn_blocking(move || db.append_message(&sender, &recipient, &content))
            .await
            .map_err(|e| RelayError::StoreWriteFailure(e.into()))??
    };

    let message = ChatMessage {
        id: row
            .id
            .parse()
            .map_err(|e| RelayError::StoreWriteFailure(anyhow::anyhow!("corrupt message id: {e}")))?,
        sender_id,
        receiver_id: recipient_id,
        content: row.content,
        created_at: row
            .created_at
            .parse()
            .map_err(|e| RelayError::StoreWriteFailure(anyhow::anyhow!("corrupt timestamp: {e}")))?,
        delivery_status: DeliveryStatus::Sent,
        read_at: None,
    };

    let outcome = dispatcher.deliver(&message);

    if outcome == DeliveryOutcome::Delivered {
        // The push landed in the recipient's buffer; advance sent -> delivered.
        // A failure here is logged, not surfaced: the message is durable and
        // delivered, the status column is a derived signal.
        let db = db.clone();
        let message_id = message.id.to_string();
        let marked = tokio::task::spawn_blocking(move || db.mark_delivered(&message_id)).await;
        match marked {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("mark_delivered failed for {}: {}", message.id, e),
            Err(e) => warn!("mark_delivered join error for {}: {}", message.id, e),
        }
    }

    Ok(outcome)
}

async fn set_presence_online(db: &Arc<Database>, user_id: Uuid) {
    let db = db.clone();
    let id = user_id.to_string();
    let result = tokio::task::spawn_blocking(move || db.set_online(&id)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("failed to set {} online: {}", user_id, e),
        Err(e) => error!("presence join error for {}: {}", user_id, e),
    }
}

async fn set_presence_offline(db: &Arc<Database>, user_id: Uuid) {
    let db = db.clone();
    let id = user_id.to_string();
    let result =
        tokio::task::spawn_blocking(move || db.set_offline(&id, Utc::now())).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("failed to set {} offline: {}", user_id, e),
        Err(e) => error!("presence join error for {}: {}", user_id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRegistry;
    use parley_types::models::Role;

    fn seeded_db() -> (Arc<Database>, Uuid, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        db.create_user(&alice.to_string(), "alice@example.com", None, "hash", Role::Customer)
            .unwrap();
        db.create_user(&bob.to_string(), "bob@example.com", None, "hash", Role::Customer)
            .unwrap();
        (Arc::new(db), alice, bob)
    }

    #[tokio::test]
    async fn offline_recipient_message_is_persisted_as_sent() {
        let (db, alice, bob) = seeded_db();
        let dispatcher = Dispatcher::new(ConnectionRegistry::new());

        let outcome = relay_frame(&dispatcher, &db, alice, bob, "hi".into())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::RecipientOffline);

        // Durable despite non-delivery; visible in the recipient's history.
        let history = db.messages_for_user(&bob.to_string(), 100).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[0].status, "sent");
    }

    #[tokio::test]
    async fn online_recipient_gets_push_and_delivered_status() {
        let (db, alice, bob) = seeded_db();
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let (handle, mut rx) = ConnectionHandle::new(bob);
        registry.register(handle);

        let outcome = relay_frame(&dispatcher, &db, alice, bob, "hi".into())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        match rx.try_recv().unwrap() {
            SessionMessage::Event(GatewayEvent::MessageDeliver {
                sender_id, content, ..
            }) => {
                assert_eq!(sender_id, alice);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected session message: {:?}", other),
        }

        let history = db.messages_for_user(&bob.to_string(), 100).unwrap();
        assert_eq!(history[0].status, "delivered");
    }

    #[tokio::test]
    async fn store_failure_surfaces_without_persisting() {
        let (db, alice, _bob) = seeded_db();
        let dispatcher = Dispatcher::new(ConnectionRegistry::new());

        // Unknown recipient violates the receiver FK: the append fails and
        // the error reaches the caller instead of being swallowed.
        let ghost = Uuid::new_v4();
        let result = relay_frame(&dispatcher, &db, alice, ghost, "hi".into()).await;
        assert!(matches!(result, Err(RelayError::StoreWriteFailure(_))));
        assert_eq!(db.count_messages().unwrap(), 0);
    }

    #[test]
    fn malformed_frame_is_an_error_valid_frame_still_parses() {
        // Missing recipient_id: the frame is rejected before any store write.
        let bad = r#"{"type":"Send","data":{"content":"hi"}}"#;
        assert!(matches!(
            parse_frame(bad),
            Err(RelayError::MalformedFrame(_))
        ));

        // The session keeps going: the next well-formed frame parses fine.
        let good = format!(
            r#"{{"type":"Send","data":{{"recipient_id":"{}","content":"hi"}}}}"#,
            Uuid::new_v4()
        );
        assert!(parse_frame(&good).is_ok());
    }

    #[tokio::test]
    async fn persisted_order_follows_frame_order() {
        let (db, alice, bob) = seeded_db();
        let dispatcher = Dispatcher::new(ConnectionRegistry::new());

        for content in ["first", "second", "third"] {
            relay_frame(&dispatcher, &db, alice, bob, content.into())
                .await
                .unwrap();
        }

        let history = db.messages_for_user(&alice.to_string(), 100).unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }
}
