//! # courier-core
//!
//! Connection lifecycle, fan-out, and the relay link for the Courier hubs.
//!
//! This crate provides the building blocks shared by the gateway hub and the
//! peer hub:
//!
//! - **Connection** - per-stream actor with read/write pumps and a rate limiter
//! - **Dispatcher** - message type to handler table
//! - **Hub** - single authority over live connections and topic subscriptions
//! - **Presence** - online/offline derived from hub membership
//! - **Relay** - reconnecting client and accepting session for the hub-to-hub link
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│ Dispatcher  │────▶│ Collaborator│
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│     Hub     │◀────│ RelayClient │
//!                     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Presence   │
//!                     └─────────────┘
//! ```

pub mod chat;
pub mod collaborators;
pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod presence;
pub mod queue;
pub mod rate_limiter;
pub mod relay;
pub mod topic;

mod pump;

pub use collaborators::{
    Authenticator, Authorizer, ChatEvent, CollaboratorError, Collaborators, Credentials,
    MessageStore, Reaction, ReactionAction, ReactionStore, TopicDirectory, TypingForwarder,
};
pub use connection::{run_connection, CallerId, ConnectionConfig, ConnectionHandle};
pub use dispatch::{Dispatcher, Handler, HandlerContext, HandlerError};
pub use hub::{BroadcastMessage, Hub, HubConfig, HubError, HubHandle, HubStats, Target};
pub use presence::PresenceRecord;
pub use queue::OutboundQueue;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use relay::{
    PushHandler, PushRouter, RelayClient, RelayConfig, RelayError, RelayHandler, RelayPeers,
    RelayRouter, RelaySession, RelayState,
};
