//! Client link envelopes.
//!
//! Clients send [`InboundMessage`] frames and receive [`OutboundMessage`]
//! frames. The `type` field is kept as a string on the inbound side so that
//! the hub can route extension types through its dispatch table and report
//! unknown ones without dropping the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Message type names used on the client link.
pub mod kinds {
    // Client to hub
    pub const SEND_MESSAGE: &str = "send_message";
    pub const JOIN_CONVERSATION: &str = "join_conversation";
    pub const TYPING: &str = "typing";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const REACTION_ADD: &str = "reaction_add";
    pub const REACTION_REMOVE: &str = "reaction_remove";

    // Hub to client
    pub const CONNECTED: &str = "connected";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const PRESENCE_UPDATE: &str = "presence_update";
    pub const JOINED: &str = "joined";
    pub const SUBSCRIPTION_ACK: &str = "subscription_ack";
    pub const UNSUBSCRIPTION_ACK: &str = "unsubscription_ack";
    pub const PONG: &str = "pong";
    pub const REACTION_UPDATE: &str = "reaction_update";
    pub const NOTIFICATION: &str = "notification";
    pub const ERROR: &str = "error";
}

/// Error codes carried in the `data.code` field of an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownMessageType,
    InvalidMessage,
    RateLimited,
    Unauthorized,
    InvalidTarget,
    NotConnected,
    ServiceUnavailable,
    RelayUnavailable,
    Timeout,
}

impl ErrorCode {
    /// Wire name of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownMessageType => "unknown_message_type",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InvalidTarget => "invalid_target",
            ErrorCode::NotConnected => "not_connected",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::RelayUnavailable => "relay_unavailable",
            ErrorCode::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message type, routed through the dispatch table.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Free-form payload for extension types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    /// Target of a reaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

impl InboundMessage {
    /// Create an inbound message of the given type with no payload.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            conversation_id: None,
            content: None,
            data: None,
            is_typing: None,
            message_id: None,
            emoji: None,
        }
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: u64) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_typing(mut self, is_typing: bool) -> Self {
        self.is_typing = Some(is_typing);
        self
    }

    #[must_use]
    pub fn with_reaction(mut self, message_id: u64, emoji: impl Into<String>) -> Self {
        self.message_id = Some(message_id);
        self.emoji = Some(emoji.into());
        self
    }

    /// The `data` field as a string, used by topic subscription frames.
    #[must_use]
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Creation time, serialized as RFC 3339.
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create an outbound message stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            conversation_id: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: u64) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Acknowledgment sent right after registration.
    #[must_use]
    pub fn connected(user_id: &str) -> Self {
        Self::new(kinds::CONNECTED).with_data(json!({
            "user_id": user_id,
            "status": "connected",
        }))
    }

    /// Error envelope.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(kinds::ERROR).with_data(json!({
            "code": code,
            "message": message.into(),
        }))
    }

    /// A persisted chat message.
    #[must_use]
    pub fn new_message(
        conversation_id: u64,
        message_id: u64,
        sender_id: &str,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self::new(kinds::NEW_MESSAGE)
            .with_conversation(conversation_id)
            .with_data(json!({
                "id": message_id,
                "sender_id": sender_id,
                "message": content,
                "timestamp": sent_at,
            }))
    }

    /// Typing indicator for a conversation.
    #[must_use]
    pub fn typing(conversation_id: u64, user_id: &str, is_typing: bool) -> Self {
        Self::new(kinds::TYPING)
            .with_conversation(conversation_id)
            .with_data(json!({
                "user_id": user_id,
                "is_typing": is_typing,
            }))
    }

    /// Online/offline transition of another caller.
    #[must_use]
    pub fn presence_update(user_id: &str, online: bool, last_seen: DateTime<Utc>) -> Self {
        Self::new(kinds::PRESENCE_UPDATE).with_data(json!({
            "user_id": user_id,
            "online": online,
            "last_seen": last_seen,
        }))
    }

    /// A reaction added to or removed from a message.
    #[must_use]
    pub fn reaction_update(
        conversation_id: u64,
        message_id: u64,
        user_id: &str,
        emoji: &str,
        action: &str,
    ) -> Self {
        Self::new(kinds::REACTION_UPDATE)
            .with_conversation(conversation_id)
            .with_data(json!({
                "message_id": message_id,
                "user_id": user_id,
                "emoji": emoji,
                "action": action,
            }))
    }

    /// A notification forwarded from the notification source.
    #[must_use]
    pub fn notification(data: Value) -> Self {
        Self::new(kinds::NOTIFICATION).with_data(data)
    }

    #[must_use]
    pub fn joined(conversation_id: u64) -> Self {
        Self::new(kinds::JOINED).with_conversation(conversation_id)
    }

    #[must_use]
    pub fn subscription_ack(topic: &str) -> Self {
        Self::new(kinds::SUBSCRIPTION_ACK).with_data(json!({
            "channel": topic,
            "status": "subscribed",
        }))
    }

    #[must_use]
    pub fn unsubscription_ack(topic: &str) -> Self {
        Self::new(kinds::UNSUBSCRIPTION_ACK).with_data(json!({
            "channel": topic,
            "status": "unsubscribed",
        }))
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::new(kinds::PONG)
    }

    /// The error code, if this is an error envelope.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.kind != kinds::ERROR {
            return None;
        }
        let code = self.data.as_ref()?.get("code")?.clone();
        serde_json::from_value(code).ok()
    }
}
