//! Interfaces to the services the hubs depend on but do not implement.
//!
//! Authentication, conversation membership, message and reaction persistence
//! and topic membership live outside this crate. Failures surface to the originating
//! caller as an error envelope and never mutate hub state.

use crate::connection::CallerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{ErrorCode, OutboundMessage};
use std::sync::Arc;
use thiserror::Error;

/// Collaborator errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The credentials did not resolve to a caller.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The backing service could not be reached.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The relay link is down or its circuit is open.
    #[error("Relay unavailable")]
    RelayUnavailable,

    /// The backing service did not answer in time.
    #[error("Request timed out")]
    Timeout,

    /// The backing service refused the operation.
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl CollaboratorError {
    /// Error code reported to the originating caller.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            CollaboratorError::InvalidCredentials => ErrorCode::Unauthorized,
            CollaboratorError::RelayUnavailable => ErrorCode::RelayUnavailable,
            CollaboratorError::Timeout => ErrorCode::Timeout,
            CollaboratorError::Unavailable(_) | CollaboratorError::Rejected(_) => {
                ErrorCode::ServiceUnavailable
            }
        }
    }
}

/// Credentials presented on upgrade.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Bearer token, from the `Authorization` header or a `token` query parameter.
    pub token: Option<String>,
    /// Caller id asserted by a trusted proxy in front of the hub.
    pub forwarded_user: Option<String>,
}

/// A chat message on its way into or out of storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Storage id, set once persisted.
    pub id: Option<u64>,
    pub conversation_id: u64,
    pub sender: CallerId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatEvent {
    /// A new, not yet persisted message stamped with the current time.
    #[must_use]
    pub fn new(conversation_id: u64, sender: CallerId, content: impl Into<String>) -> Self {
        Self {
            id: None,
            conversation_id,
            sender,
            content: content.into(),
            sent_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The `new_message` envelope delivered to clients.
    #[must_use]
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage::new_message(
            self.conversation_id,
            self.id.unwrap_or_default(),
            self.sender.as_str(),
            &self.content,
            self.sent_at,
        )
    }
}

/// Whether a reaction was added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionAction {
    Add,
    Remove,
}

impl ReactionAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionAction::Add => "add",
            ReactionAction::Remove => "remove",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(ReactionAction::Add),
            "remove" => Some(ReactionAction::Remove),
            _ => None,
        }
    }
}

/// A reaction on a persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub conversation_id: u64,
    pub message_id: u64,
    pub user: CallerId,
    pub emoji: String,
    pub action: ReactionAction,
}

impl Reaction {
    /// The `reaction_update` envelope delivered to clients.
    #[must_use]
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage::reaction_update(
            self.conversation_id,
            self.message_id,
            self.user.as_str(),
            &self.emoji,
            self.action.as_str(),
        )
    }
}

/// Resolves upgrade credentials to a caller.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<CallerId, CollaboratorError>;
}

/// Decides whether a caller may act on a conversation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(
        &self,
        caller: &CallerId,
        conversation_id: u64,
    ) -> Result<bool, CollaboratorError>;
}

/// Persists chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store the event and return its id.
    async fn persist(&self, event: &ChatEvent) -> Result<u64, CollaboratorError>;
}

/// Persists message reactions.
#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Apply the reaction and return the action that took effect.
    ///
    /// Adding a reaction the caller already left removes it. Messages outside
    /// the named conversation are rejected.
    async fn apply(&self, reaction: &Reaction) -> Result<ReactionAction, CollaboratorError>;
}

/// Carries typing indicators to hubs beyond the local one.
pub trait TypingForwarder: Send + Sync {
    fn forward_typing(&self, conversation_id: u64, caller: &CallerId, is_typing: bool);
}

/// Lists the callers that belong to a topic, whether or not they joined it.
#[async_trait]
pub trait TopicDirectory: Send + Sync {
    async fn members(&self, topic: &str) -> Result<Vec<CallerId>, CollaboratorError>;
}

/// The collaborators used by the built-in handlers.
#[derive(Clone)]
pub struct Collaborators {
    pub authorizer: Arc<dyn Authorizer>,
    pub store: Arc<dyn MessageStore>,
    pub reactions: Arc<dyn ReactionStore>,
    pub directory: Arc<dyn TopicDirectory>,
}
