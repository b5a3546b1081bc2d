//! The hub-to-hub relay link.
//!
//! The gateway hub dials the peer hub with a [`RelayClient`], which keeps the
//! link up, correlates requests with replies, and hands unsolicited pushes to
//! a [`PushHandler`], usually a [`PushRouter`]. The peer hub serves each
//! incoming link with a [`RelaySession`] and tracks live links in
//! [`RelayPeers`].

pub mod bridge;
pub mod client;
pub mod server;

pub use bridge::{
    ChatPushHandler, ChatRelayHandler, JoinRelayHandler, NotificationPushHandler, PublishingStore,
    ReactionRelayHandler, RelayAuthorizer, RelayMessageStore, TypingRelayHandler,
    NOTIFICATIONS_TOPIC,
};
pub use client::{PushHandler, PushRouter, RelayClient, RelayConfig, RelayError, RelayState};
pub use server::{RelayHandler, RelayPeers, RelayRouter, RelaySession, SessionId};
