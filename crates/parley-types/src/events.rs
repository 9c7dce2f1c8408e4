use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events sent over the WebSocket gateway, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is registered and live.
    Ready { user_id: Uuid },

    /// A message addressed to this user was relayed in real time.
    MessageDeliver {
        sender_id: Uuid,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// A user came online or went offline.
    PresenceUpdate { user_id: Uuid, online: bool },

    /// Something went wrong with a frame this client sent.
    Error { code: String, message: String },
}

/// Frames sent FROM client TO server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Send a direct message to another user.
    Send { recipient_id: Uuid, content: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_parses() {
        let raw = r#"{"type":"Send","data":{"recipient_id":"00000000-0000-0000-0000-000000000001","content":"hi"}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        let ClientFrame::Send {
            recipient_id,
            content,
        } = frame;
        assert_eq!(
            recipient_id,
            "00000000-0000-0000-0000-000000000001".parse::<Uuid>().unwrap()
        );
        assert_eq!(content, "hi");
    }

    #[test]
    fn frame_without_recipient_is_rejected() {
        let raw = r#"{"type":"Send","data":{"content":"hi"}}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let raw = r#"{"type":"Shout","data":{"content":"hi"}}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }

    #[test]
    fn deliver_event_shape() {
        let event = GatewayEvent::MessageDeliver {
            sender_id: Uuid::nil(),
            content: "hello".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "MessageDeliver");
        assert_eq!(json["data"]["content"], "hello");
    }
}
