//! Wire-format events and the scope -> topic mapping.
//!
//! Every frame on the socket is a `{type, payload}` JSON object, modeled as
//! adjacently tagged serde enums in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::MessageRecord;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum InboundEvent {
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "message:send", rename_all = "camelCase")]
    MessageSend {
        channel_id: String,
        content: String,
        #[serde(rename = "type")]
        kind: String,
    },

    #[serde(rename = "message:typing", rename_all = "camelCase")]
    MessageTyping {
        channel_id: String,
        is_typing: bool,
    },

    #[serde(rename = "message:read", rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        channel_id: String,
    },

    #[serde(rename = "channel:join", rename_all = "camelCase")]
    ChannelJoin { channel_id: String },

    #[serde(rename = "channel:leave", rename_all = "camelCase")]
    ChannelLeave { channel_id: String },

    #[serde(rename = "presence:update")]
    PresenceUpdate { status: PresenceStatus },

    #[serde(rename = "heartbeat")]
    Heartbeat,
}

impl InboundEvent {
    /// The wire name, echoed back in `error` events.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Auth { .. } => "auth",
            InboundEvent::MessageSend { .. } => "message:send",
            InboundEvent::MessageTyping { .. } => "message:typing",
            InboundEvent::MessageRead { .. } => "message:read",
            InboundEvent::ChannelJoin { .. } => "channel:join",
            InboundEvent::ChannelLeave { .. } => "channel:leave",
            InboundEvent::PresenceUpdate { .. } => "presence:update",
            InboundEvent::Heartbeat => "heartbeat",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundEvent {
    #[serde(rename = "ready", rename_all = "camelCase")]
    Ready {
        connection_id: String,
        user_id: String,
        rooms: Vec<String>,
        heartbeat_interval_ms: u64,
    },

    #[serde(rename = "message:new")]
    MessageNew { message: MessageRecord },

    #[serde(rename = "message:read", rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        channel_id: String,
        user_id: String,
    },

    #[serde(rename = "user:typing", rename_all = "camelCase")]
    UserTyping {
        channel_id: String,
        user_id: String,
        is_typing: bool,
    },

    #[serde(rename = "user:online", rename_all = "camelCase")]
    UserOnline { user_id: String },

    #[serde(rename = "user:offline", rename_all = "camelCase")]
    UserOffline { user_id: String },

    #[serde(rename = "user:presence", rename_all = "camelCase")]
    UserPresence {
        user_id: String,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "channel:joined", rename_all = "camelCase")]
    ChannelJoined { channel_id: String },

    #[serde(rename = "channel:left", rename_all = "camelCase")]
    ChannelLeft { channel_id: String },

    #[serde(rename = "heartbeat:ack")]
    HeartbeatAck,

    #[serde(rename = "error")]
    Error { event: String, message: String },
}

// ---------------------------------------------------------------------------
// Presence status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

// ---------------------------------------------------------------------------
// Delivery scope -> bus topic
// ---------------------------------------------------------------------------

/// Who an outbound event is addressed to. Maps deterministically onto a
/// fanout bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    Room(String),
    User(String),
    Broadcast,
}

impl EventScope {
    pub fn topic(&self) -> String {
        match self {
            EventScope::Room(room_id) => format!("room.{room_id}"),
            EventScope::User(user_id) => format!("user.{user_id}"),
            EventScope::Broadcast => "broadcast".to_string(),
        }
    }
}

/// Topic namespace for per-process presence reports.
pub fn presence_topic(process_id: &str) -> String {
    format!("presence.{process_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_message_send_shape() {
        let raw = json!({
            "type": "message:send",
            "payload": { "channelId": "room_1", "content": "hi", "type": "text" }
        });

        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        match event {
            InboundEvent::MessageSend {
                channel_id,
                content,
                kind,
            } => {
                assert_eq!(channel_id, "room_1");
                assert_eq!(content, "hi");
                assert_eq!(kind, "text");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn inbound_typing_and_presence_shapes() {
        let typing: InboundEvent = serde_json::from_value(json!({
            "type": "message:typing",
            "payload": { "channelId": "room_1", "isTyping": true }
        }))
        .unwrap();
        assert!(matches!(
            typing,
            InboundEvent::MessageTyping { is_typing: true, .. }
        ));

        let presence: InboundEvent = serde_json::from_value(json!({
            "type": "presence:update",
            "payload": { "status": "away" }
        }))
        .unwrap();
        assert!(matches!(
            presence,
            InboundEvent::PresenceUpdate {
                status: PresenceStatus::Away
            }
        ));
    }

    #[test]
    fn inbound_heartbeat_without_payload() {
        let event: InboundEvent = serde_json::from_value(json!({ "type": "heartbeat" })).unwrap();
        assert!(matches!(event, InboundEvent::Heartbeat));
    }

    #[test]
    fn inbound_unknown_type_is_rejected() {
        let result: Result<InboundEvent, _> = serde_json::from_value(json!({
            "type": "admin:shutdown",
            "payload": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn outbound_error_shape() {
        let event = OutboundEvent::Error {
            event: "message:send".to_string(),
            message: "not a member".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["event"], "message:send");
        assert_eq!(value["payload"]["message"], "not a member");
    }

    #[test]
    fn outbound_presence_uses_camel_case_keys() {
        let event = OutboundEvent::UserPresence {
            user_id: "usr_a".to_string(),
            status: PresenceStatus::Busy,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user:presence");
        assert_eq!(value["payload"]["userId"], "usr_a");
        assert_eq!(value["payload"]["status"], "busy");
        assert!(value["payload"]["timestamp"].is_string());
    }

    #[test]
    fn scope_topics_are_deterministic() {
        assert_eq!(EventScope::Room("room_1".into()).topic(), "room.room_1");
        assert_eq!(EventScope::User("usr_a".into()).topic(), "user.usr_a");
        assert_eq!(EventScope::Broadcast.topic(), "broadcast");
        assert_eq!(presence_topic("proc_1"), "presence.proc_1");
    }
}
