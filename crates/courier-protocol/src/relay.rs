//! Relay link envelopes.
//!
//! The relay link carries three kinds of envelope over a single stream:
//!
//! - **requests** carry a `request_id` and no `status`; the sender waits for a reply
//! - **replies** echo the `request_id` and set `status`
//! - **pushes** carry neither and are rebroadcast by the receiving hub

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Relay message type names.
pub mod relay_kinds {
    /// A chat message: a request from the gateway, a push from the peer.
    pub const CHAT_MESSAGE: &str = "chat_message";
    /// Membership check for a conversation join, answered with `allowed`.
    pub const JOIN_CONVERSATION: &str = "join_conversation";
    /// Typing indicator, always a push.
    pub const TYPING: &str = "typing";
    pub const REACTION_ADD: &str = "reaction_add";
    pub const REACTION_REMOVE: &str = "reaction_remove";
    /// An applied reaction, pushed to the other gateways.
    pub const REACTION_UPDATE: &str = "reaction_update";
    /// A notification for one user, pushed by the peer.
    pub const NOTIFICATION: &str = "notification";
}

/// Outcome carried by a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Success,
    Error,
}

/// An envelope on the relay link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation id, present when a reply is expected or when replying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RelayStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayEnvelope {
    /// Create a push envelope of the given type.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            status: None,
            conversation_id: None,
            user_id: None,
            data: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl ToString) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set a single field of the `data` object.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Build the success reply to this envelope, echoing its correlation id.
    #[must_use]
    pub fn success(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            request_id: self.request_id.clone(),
            status: Some(RelayStatus::Success),
            conversation_id: self.conversation_id.clone(),
            user_id: self.user_id.clone(),
            data: None,
            error: None,
        }
    }

    /// Build the error reply to this envelope, echoing its correlation id.
    #[must_use]
    pub fn failure(&self, error: impl Into<String>) -> Self {
        Self {
            status: Some(RelayStatus::Error),
            error: Some(error.into()),
            ..self.success()
        }
    }

    /// Whether the sender is waiting for a reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.request_id.is_some() && self.status.is_none()
    }

    /// Whether this envelope answers an earlier request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.request_id.is_some() && self.status.is_some()
    }

    /// Read a field of the `data` object.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key)
    }

    /// Parse the conversation id as an integer.
    #[must_use]
    pub fn conversation_number(&self) -> Option<u64> {
        self.conversation_id.as_deref()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_and_reply_classification() {
        let push = RelayEnvelope::new(relay_kinds::CHAT_MESSAGE);
        assert!(!push.expects_reply());
        assert!(!push.is_reply());

        let request = push.clone().with_request_id("req-1");
        assert!(request.expects_reply());
        assert!(!request.is_reply());

        let reply = request.success();
        assert!(reply.is_reply());
        assert_eq!(reply.request_id.as_deref(), Some("req-1"));
        assert_eq!(reply.status, Some(RelayStatus::Success));
    }

    #[test]
    fn test_failure_reply_carries_error() {
        let request = RelayEnvelope::new(relay_kinds::CHAT_MESSAGE)
            .with_request_id("req-2")
            .with_conversation(42u64)
            .with_user("u1");
        let reply = request.failure("access denied");

        assert_eq!(reply.status, Some(RelayStatus::Error));
        assert_eq!(reply.error.as_deref(), Some("access denied"));
        assert_eq!(reply.conversation_id.as_deref(), Some("42"));
        assert_eq!(reply.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_status_wire_format() {
        let reply = RelayEnvelope::new("chat_message")
            .with_request_id("r")
            .success();
        let text = serde_json::to_string(&reply).unwrap();
        assert!(text.contains("\"status\":\"success\""));
        assert!(!text.contains("\"error\""));
    }

    #[test]
    fn test_fields() {
        let env = RelayEnvelope::new("chat_message")
            .with_conversation(9u64)
            .with_field("content", "hello")
            .with_field("message_id", 3u64);
        assert_eq!(env.field("content").and_then(Value::as_str), Some("hello"));
        assert_eq!(env.field("message_id").and_then(Value::as_u64), Some(3));
        assert_eq!(env.conversation_number(), Some(9));
        assert!(env.field("missing").is_none());
    }
}
