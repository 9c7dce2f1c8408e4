use tokio::sync::broadcast;

use parley_types::events::GatewayEvent;
use parley_types::models::Message;

use crate::registry::{ConnectionRegistry, SessionMessage};

/// Outcome of a single delivery attempt. Non-delivery is a value, not an
/// exception: `RecipientOffline` is the expected steady state and
/// `TransportFailed` is recovered by eviction, never by retrying here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    RecipientOffline,
    TransportFailed,
}

/// Delivers persisted messages to live connections and fans presence
/// updates out to every connected client.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    broadcast_tx: broadcast::Sender<GatewayEvent>,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            registry,
            broadcast_tx,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Subscribe to gateway-wide events (presence updates).
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.broadcast_tx.send(event);
    }

    /// Best-effort push of a persisted message to the recipient's live
    /// connection. The message is already durable when this runs; a
    /// non-`Delivered` outcome only means the recipient catches up through
    /// history later.
    ///
    /// A failed push evicts exactly the handle that failed, so the next
    /// lookup does not hit the same broken transport. The lookup-then-push
    /// window is inherently racy; a handle that closed in between simply
    /// resolves to `TransportFailed`.
    pub fn deliver(&self, message: &Message) -> DeliveryOutcome {
        let Some(handle) = self.registry.lookup(message.receiver_id) else {
            return DeliveryOutcome::RecipientOffline;
        };

        let event = GatewayEvent::MessageDeliver {
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
        };

        match handle.push(SessionMessage::Event(event)) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(_) => {
                self.registry.unregister(message.receiver_id, handle.conn_id);
                DeliveryOutcome::TransportFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, OUTBOUND_BUFFER};
    use chrono::Utc;
    use parley_types::models::DeliveryStatus;
    use uuid::Uuid;

    fn message_to(receiver_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id,
            content: "hi".into(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Sent,
            read_at: None,
        }
    }

    #[test]
    fn offline_recipient_is_not_an_error() {
        let dispatcher = Dispatcher::new(ConnectionRegistry::new());
        let outcome = dispatcher.deliver(&message_to(Uuid::new_v4()));
        assert_eq!(outcome, DeliveryOutcome::RecipientOffline);
    }

    #[test]
    fn delivers_into_live_buffer() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let receiver = Uuid::new_v4();
        let (handle, mut rx) = ConnectionHandle::new(receiver);
        registry.register(handle);

        let message = message_to(receiver);
        assert_eq!(dispatcher.deliver(&message), DeliveryOutcome::Delivered);

        match rx.try_recv().unwrap() {
            SessionMessage::Event(GatewayEvent::MessageDeliver {
                sender_id, content, ..
            }) => {
                assert_eq!(sender_id, message.sender_id);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected session message: {:?}", other),
        }
    }

    #[test]
    fn closed_transport_fails_and_evicts() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let receiver = Uuid::new_v4();
        let (handle, rx) = ConnectionHandle::new(receiver);
        registry.register(handle);
        drop(rx); // connection torn down

        assert_eq!(
            dispatcher.deliver(&message_to(receiver)),
            DeliveryOutcome::TransportFailed
        );
        // Self-healing: the broken handle is gone, the next attempt is a
        // plain offline outcome.
        assert!(registry.lookup(receiver).is_none());
        assert_eq!(
            dispatcher.deliver(&message_to(receiver)),
            DeliveryOutcome::RecipientOffline
        );
    }

    #[test]
    fn full_buffer_fails_fast_without_blocking() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let receiver = Uuid::new_v4();
        let (handle, _rx) = ConnectionHandle::new(receiver);
        registry.register(handle);

        for _ in 0..OUTBOUND_BUFFER {
            assert_eq!(
                dispatcher.deliver(&message_to(receiver)),
                DeliveryOutcome::Delivered
            );
        }

        // Slow consumer: the buffer is full, delivery fails fast and the
        // stalled handle is evicted.
        assert_eq!(
            dispatcher.deliver(&message_to(receiver)),
            DeliveryOutcome::TransportFailed
        );
        assert!(registry.lookup(receiver).is_none());
    }

    #[test]
    fn eviction_spares_a_newer_connection() {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());

        let receiver = Uuid::new_v4();
        let (stale, stale_rx) = ConnectionHandle::new(receiver);
        registry.register(stale.clone());
        drop(stale_rx);

        // The user reconnected between our lookup and the failed push.
        let (fresh, _fresh_rx) = ConnectionHandle::new(receiver);
        let fresh_conn = fresh.conn_id;
        registry.register(fresh);

        // Pushing through the stale handle fails, but eviction is keyed on
        // the stale conn_id and must not remove the fresh entry.
        assert!(stale.push(SessionMessage::Superseded).is_err());
        registry.unregister(receiver, stale.conn_id);
        assert_eq!(registry.lookup(receiver).unwrap().conn_id, fresh_conn);
    }
}
