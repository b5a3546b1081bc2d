//! Message dispatch.
//!
//! The [`Dispatcher`] maps inbound message types to [`Handler`]s. Types
//! marked as rate-limited consult the connection's limiter before their
//! handler runs, so a rejected message has no side effect.

use crate::collaborators::CollaboratorError;
use crate::connection::{CallerId, ConnectionHandle};
use crate::hub::{HubError, HubHandle};
use async_trait::async_trait;
use courier_protocol::{ErrorCode, InboundMessage, OutboundMessage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Handler errors, reported to the caller as an `error` envelope.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A required field is missing or malformed.
    #[error("{0}")]
    InvalidMessage(String),

    /// The caller may not perform this action.
    #[error("{0}")]
    Unauthorized(String),

    /// Hub rejected the operation.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// A collaborator failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl HandlerError {
    /// Error code carried by the envelope.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            HandlerError::Unauthorized(_) => ErrorCode::Unauthorized,
            HandlerError::Hub(HubError::NotConnected(_)) => ErrorCode::NotConnected,
            HandlerError::Hub(HubError::InvalidTopic(_)) => ErrorCode::InvalidTarget,
            HandlerError::Hub(HubError::Closed) => ErrorCode::ServiceUnavailable,
            HandlerError::Collaborator(e) => e.code(),
        }
    }
}

/// What a handler gets to work with.
#[derive(Clone)]
pub struct HandlerContext {
    pub hub: HubHandle,
    pub connection: Arc<ConnectionHandle>,
}

impl HandlerContext {
    #[must_use]
    pub fn new(hub: HubHandle, connection: Arc<ConnectionHandle>) -> Self {
        Self { hub, connection }
    }

    #[must_use]
    pub fn caller(&self) -> &CallerId {
        self.connection.caller()
    }

    /// Enqueue a message for this connection.
    ///
    /// A full queue closes the connection and returns `false`.
    pub fn reply(&self, msg: OutboundMessage) -> bool {
        self.reply_shared(Arc::new(msg))
    }

    /// Like [`reply`](Self::reply) for a message that is also fanned out.
    pub fn reply_shared(&self, msg: Arc<OutboundMessage>) -> bool {
        if self.connection.enqueue(msg) {
            return true;
        }
        warn!(caller = %self.caller(), "Outbound queue full, closing connection");
        self.connection.close();
        false
    }

    /// Reply with an `error` envelope.
    pub fn reply_error(&self, code: ErrorCode, message: impl Into<String>) -> bool {
        self.reply(OutboundMessage::error(code, message))
    }
}

/// Handles one inbound message type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError>;
}

/// Message type to handler table.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn Handler>>,
    rate_limited: HashSet<String>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the type.
    #[must_use]
    pub fn with_handler(mut self, kind: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    /// Register a handler whose messages count against the rate limit.
    #[must_use]
    pub fn with_rate_limited_handler(
        mut self,
        kind: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Self {
        let kind = kind.into();
        self.rate_limited.insert(kind.clone());
        self.with_handler(kind, handler)
    }

    #[must_use]
    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    #[must_use]
    pub fn is_rate_limited(&self, kind: &str) -> bool {
        self.rate_limited.contains(kind)
    }

    /// Route one message. Every failure becomes an `error` envelope for the
    /// sender; the connection stays open.
    pub async fn dispatch(&self, ctx: &HandlerContext, msg: InboundMessage) {
        let Some(handler) = self.handlers.get(msg.kind.as_str()) else {
            debug!(caller = %ctx.caller(), kind = %msg.kind, "Unknown message type");
            ctx.reply_error(
                ErrorCode::UnknownMessageType,
                format!("Unknown message type: {}", msg.kind),
            );
            return;
        };

        if self.rate_limited.contains(msg.kind.as_str()) && !ctx.connection.rate_limiter().check() {
            debug!(caller = %ctx.caller(), kind = %msg.kind, "Rate limited");
            ctx.reply_error(ErrorCode::RateLimited, "Rate limit exceeded");
            return;
        }

        let kind = msg.kind.clone();
        if let Err(e) = handler.handle(ctx, msg).await {
            debug!(caller = %ctx.caller(), kind = %kind, error = %e, "Handler failed");
            ctx.reply_error(e.code(), e.to_string());
        }
    }
}
