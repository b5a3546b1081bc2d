//! Conversation events over the relay link.
//!
//! On the gateway, [`RelayMessageStore`] persists messages and reactions by
//! asking the peer, [`RelayAuthorizer`] defers membership checks to it, and
//! [`ChatPushHandler`] and [`NotificationPushHandler`] republish the peer's
//! pushes locally. On the peer, one [`RelayHandler`] per envelope type answers
//! the gateways and [`PublishingStore`] pushes locally sent events out to
//! every gateway.

use super::client::{PushHandler, RelayClient, RelayError};
use super::server::{RelayHandler, RelayPeers, SessionId};
use crate::chat::deliver_to_absent_members;
use crate::collaborators::{
    Authorizer, ChatEvent, CollaboratorError, MessageStore, Reaction, ReactionAction,
    ReactionStore, TopicDirectory, TypingForwarder,
};
use crate::connection::CallerId;
use crate::hub::{BroadcastMessage, HubHandle};
use crate::topic::conversation_topic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{relay_kinds, OutboundMessage, RelayEnvelope};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Topic every notification is also published on.
pub const NOTIFICATIONS_TOPIC: &str = "notifications";

impl From<RelayError> for CollaboratorError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Timeout => Self::Timeout,
            RelayError::Remote(message) => Self::Rejected(message),
            RelayError::NotConnected
            | RelayError::Unavailable
            | RelayError::Closed
            | RelayError::QueueFull => Self::RelayUnavailable,
        }
    }
}

fn conversation(envelope: &RelayEnvelope) -> Result<u64, String> {
    envelope
        .conversation_number()
        .ok_or_else(|| "Missing conversation_id".to_string())
}

fn sender(envelope: &RelayEnvelope) -> Result<CallerId, String> {
    envelope
        .user_id
        .as_deref()
        .filter(|u| !u.is_empty())
        .map(CallerId::from)
        .ok_or_else(|| "Missing user_id".to_string())
}

/// Error text for a reply. A refusal passes through as the peer stated it.
fn reply_error(e: CollaboratorError) -> String {
    match e {
        CollaboratorError::Rejected(message) => message,
        other => other.to_string(),
    }
}

async fn require_member(
    authorizer: &dyn Authorizer,
    caller: &CallerId,
    conversation_id: u64,
) -> Result<(), String> {
    let allowed = authorizer
        .authorize(caller, conversation_id)
        .await
        .map_err(reply_error)?;
    if allowed {
        Ok(())
    } else {
        Err(format!("Access denied to conversation {conversation_id}"))
    }
}

fn chat_envelope(event: &ChatEvent) -> RelayEnvelope {
    let envelope = RelayEnvelope::new(relay_kinds::CHAT_MESSAGE)
        .with_conversation(event.conversation_id)
        .with_user(event.sender.as_str())
        .with_field("content", event.content.as_str())
        .with_field("sent_at", event.sent_at.to_rfc3339());
    match event.id {
        Some(id) => envelope.with_field("message_id", id),
        None => envelope,
    }
}

/// Rebuild a chat event from a relay envelope.
fn chat_event(envelope: &RelayEnvelope) -> Result<ChatEvent, String> {
    let conversation_id = conversation(envelope)?;
    let sender = sender(envelope)?;
    let content = envelope
        .field("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "Message cannot be empty".to_string())?;

    let mut event = ChatEvent::new(conversation_id, sender, content);
    if let Some(sent_at) = envelope
        .field("sent_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        event.sent_at = sent_at.with_timezone(&Utc);
    }
    if let Some(id) = envelope.field("message_id").and_then(Value::as_u64) {
        event = event.with_id(id);
    }
    Ok(event)
}

fn reaction_envelope(kind: &str, reaction: &Reaction) -> RelayEnvelope {
    RelayEnvelope::new(kind)
        .with_conversation(reaction.conversation_id)
        .with_user(reaction.user.as_str())
        .with_field("message_id", reaction.message_id)
        .with_field("emoji", reaction.emoji.as_str())
        .with_field("action", reaction.action.as_str())
}

/// Rebuild a reaction. Requests carry the action in their type, updates in
/// the `action` field.
fn reaction(envelope: &RelayEnvelope) -> Result<Reaction, String> {
    let action = match envelope.kind.as_str() {
        relay_kinds::REACTION_ADD => ReactionAction::Add,
        relay_kinds::REACTION_REMOVE => ReactionAction::Remove,
        _ => envelope
            .field("action")
            .and_then(Value::as_str)
            .and_then(ReactionAction::parse)
            .ok_or_else(|| "Invalid reaction action".to_string())?,
    };
    let message_id = envelope
        .field("message_id")
        .and_then(Value::as_u64)
        .filter(|id| *id != 0);
    let emoji = envelope
        .field("emoji")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty());
    let (Some(message_id), Some(emoji)) = (message_id, emoji) else {
        return Err("Missing message_id or emoji".to_string());
    };

    Ok(Reaction {
        conversation_id: conversation(envelope)?,
        message_id,
        user: sender(envelope)?,
        emoji: emoji.to_string(),
        action,
    })
}

fn typing_envelope(conversation_id: u64, caller: &CallerId, is_typing: bool) -> RelayEnvelope {
    RelayEnvelope::new(relay_kinds::TYPING)
        .with_conversation(conversation_id)
        .with_user(caller.as_str())
        .with_field("is_typing", is_typing)
}

fn typing_update(envelope: &RelayEnvelope) -> Result<(u64, CallerId, OutboundMessage), String> {
    let conversation_id = conversation(envelope)?;
    let caller = sender(envelope)?;
    let is_typing = envelope
        .field("is_typing")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let update = OutboundMessage::typing(conversation_id, caller.as_str(), is_typing);
    Ok((conversation_id, caller, update))
}

/// Gateway-side store: messages and reactions are persisted on the peer.
pub struct RelayMessageStore {
    client: RelayClient,
}

impl RelayMessageStore {
    #[must_use]
    pub fn new(client: RelayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageStore for RelayMessageStore {
    async fn persist(&self, event: &ChatEvent) -> Result<u64, CollaboratorError> {
        let reply = self.client.request(chat_envelope(event)).await?;
        reply
            .field("message_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| CollaboratorError::Unavailable("Relay reply without message_id".into()))
    }
}

#[async_trait]
impl ReactionStore for RelayMessageStore {
    async fn apply(&self, reaction: &Reaction) -> Result<ReactionAction, CollaboratorError> {
        let kind = match reaction.action {
            ReactionAction::Add => relay_kinds::REACTION_ADD,
            ReactionAction::Remove => relay_kinds::REACTION_REMOVE,
        };
        let reply = self.client.request(reaction_envelope(kind, reaction)).await?;
        reply
            .field("action")
            .and_then(Value::as_str)
            .and_then(ReactionAction::parse)
            .ok_or_else(|| CollaboratorError::Unavailable("Relay reply without action".into()))
    }
}

/// Gateway-side authorizer: the peer owns conversation membership.
pub struct RelayAuthorizer {
    client: RelayClient,
}

impl RelayAuthorizer {
    #[must_use]
    pub fn new(client: RelayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authorizer for RelayAuthorizer {
    async fn authorize(&self, caller: &CallerId, conversation_id: u64) -> Result<bool, CollaboratorError> {
        let request = RelayEnvelope::new(relay_kinds::JOIN_CONVERSATION)
            .with_conversation(conversation_id)
            .with_user(caller.as_str());
        let reply = self.client.request(request).await?;
        reply
            .field("allowed")
            .and_then(Value::as_bool)
            .ok_or_else(|| CollaboratorError::Unavailable("Relay reply without allowed".into()))
    }
}

impl TypingForwarder for RelayClient {
    fn forward_typing(&self, conversation_id: u64, caller: &CallerId, is_typing: bool) {
        if let Err(e) = self.send(typing_envelope(conversation_id, caller, is_typing)) {
            debug!(conversation_id, error = %e, "Typing indicator not relayed");
        }
    }
}

impl TypingForwarder for RelayPeers {
    fn forward_typing(&self, conversation_id: u64, caller: &CallerId, is_typing: bool) {
        self.push_all(&typing_envelope(conversation_id, caller, is_typing));
    }
}

/// Gateway-side push handler for conversation events.
///
/// Messages and reactions reach the conversation topic and every member who
/// is online here without having joined it, the same audience a locally sent
/// message gets. Typing indicators only reach the topic.
pub struct ChatPushHandler {
    hub: HubHandle,
    directory: Arc<dyn TopicDirectory>,
}

impl ChatPushHandler {
    #[must_use]
    pub fn new(hub: HubHandle, directory: Arc<dyn TopicDirectory>) -> Self {
        Self { hub, directory }
    }

    async fn publish(&self, conversation_id: u64, outbound: OutboundMessage) {
        let outbound = Arc::new(outbound);
        let topic = conversation_topic(conversation_id);
        if let Err(e) = self
            .hub
            .broadcast(BroadcastMessage::to_topic(topic.clone(), outbound.clone()))
        {
            warn!(error = %e, "Could not republish relay push");
            return;
        }
        if let Err(e) =
            deliver_to_absent_members(&self.hub, self.directory.as_ref(), &topic, None, &outbound).await
        {
            warn!(error = %e, "Could not deliver relay push to members");
        }
    }
}

#[async_trait]
impl PushHandler for ChatPushHandler {
    async fn on_push(&self, envelope: RelayEnvelope) {
        let result = match envelope.kind.as_str() {
            relay_kinds::CHAT_MESSAGE => match chat_event(&envelope) {
                Ok(event) => {
                    self.publish(event.conversation_id, event.to_outbound()).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            relay_kinds::REACTION_UPDATE => match reaction(&envelope) {
                Ok(reaction) => {
                    self.publish(reaction.conversation_id, reaction.to_outbound()).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            relay_kinds::TYPING => typing_update(&envelope).map(|(conversation_id, caller, update)| {
                let topic = conversation_topic(conversation_id);
                if let Err(e) = self
                    .hub
                    .broadcast(BroadcastMessage::to_topic_except(topic, caller, update))
                {
                    warn!(error = %e, "Could not republish typing indicator");
                }
            }),
            _ => {
                debug!(kind = %envelope.kind, "Ignoring relay push");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(kind = %envelope.kind, error = %e, "Dropping malformed relay push");
        }
    }
}

/// Gateway-side push handler for notifications.
///
/// The recipient named by `to_user_id` gets the notification directly; every
/// other subscriber of [`NOTIFICATIONS_TOPIC`] gets it through the topic.
pub struct NotificationPushHandler {
    hub: HubHandle,
}

impl NotificationPushHandler {
    #[must_use]
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

fn recipient(data: &Map<String, Value>) -> Option<CallerId> {
    match data.get("to_user_id")? {
        Value::String(s) if !s.is_empty() => Some(CallerId::from(s.as_str())),
        Value::Number(n) => Some(CallerId::from(n.to_string())),
        _ => None,
    }
}

#[async_trait]
impl PushHandler for NotificationPushHandler {
    async fn on_push(&self, envelope: RelayEnvelope) {
        let data = envelope.data.unwrap_or_default();
        let to = recipient(&data);
        let notification = Arc::new(OutboundMessage::notification(Value::Object(data)));

        let result = match to {
            Some(user) => {
                debug!(user = %user, "Forwarding notification");
                self.hub
                    .send_to(user.clone(), notification.clone())
                    .and_then(|()| {
                        self.hub.broadcast(BroadcastMessage::to_topic_except(
                            NOTIFICATIONS_TOPIC,
                            user,
                            notification,
                        ))
                    })
            }
            None => self
                .hub
                .broadcast(BroadcastMessage::to_topic(NOTIFICATIONS_TOPIC, notification)),
        };
        if let Err(e) = result {
            warn!(error = %e, "Could not forward notification");
        }
    }
}

/// Peer-side handler for `chat_message` requests from a gateway.
///
/// The message is persisted, delivered to the peer's own subscribers, pushed
/// to every other gateway and acknowledged with its id.
pub struct ChatRelayHandler {
    hub: HubHandle,
    authorizer: Arc<dyn Authorizer>,
    store: Arc<dyn MessageStore>,
    peers: RelayPeers,
}

impl ChatRelayHandler {
    #[must_use]
    pub fn new(
        hub: HubHandle,
        authorizer: Arc<dyn Authorizer>,
        store: Arc<dyn MessageStore>,
        peers: RelayPeers,
    ) -> Self {
        Self {
            hub,
            authorizer,
            store,
            peers,
        }
    }
}

#[async_trait]
impl RelayHandler for ChatRelayHandler {
    async fn handle(
        &self,
        origin: SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<Option<Map<String, Value>>, String> {
        let event = chat_event(envelope)?;
        require_member(self.authorizer.as_ref(), &event.sender, event.conversation_id).await?;

        let id = self.store.persist(&event).await.map_err(reply_error)?;
        let event = event.with_id(id);

        let topic = conversation_topic(event.conversation_id);
        if let Err(e) = self
            .hub
            .broadcast(BroadcastMessage::to_topic(topic, event.to_outbound()))
        {
            warn!(error = %e, "Could not deliver relayed message locally");
        }
        self.peers.push_except(origin, &chat_envelope(&event));

        debug!(session = origin, conversation_id = event.conversation_id, message_id = id, "Relayed message stored");
        let mut data = Map::new();
        data.insert("message_id".into(), id.into());
        data.insert("sent_at".into(), event.sent_at.to_rfc3339().into());
        Ok(Some(data))
    }
}

/// Peer-side handler for `reaction_add` and `reaction_remove` requests.
///
/// The applied reaction goes to the peer's own subscribers and, as a
/// `reaction_update` push, to every other gateway. The reply carries the
/// action that took effect.
#[derive(Clone)]
pub struct ReactionRelayHandler {
    hub: HubHandle,
    authorizer: Arc<dyn Authorizer>,
    reactions: Arc<dyn ReactionStore>,
    peers: RelayPeers,
}

impl ReactionRelayHandler {
    #[must_use]
    pub fn new(
        hub: HubHandle,
        authorizer: Arc<dyn Authorizer>,
        reactions: Arc<dyn ReactionStore>,
        peers: RelayPeers,
    ) -> Self {
        Self {
            hub,
            authorizer,
            reactions,
            peers,
        }
    }
}

#[async_trait]
impl RelayHandler for ReactionRelayHandler {
    async fn handle(
        &self,
        origin: SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<Option<Map<String, Value>>, String> {
        let mut reaction = reaction(envelope)?;
        require_member(self.authorizer.as_ref(), &reaction.user, reaction.conversation_id).await?;
        reaction.action = self.reactions.apply(&reaction).await.map_err(reply_error)?;

        let topic = conversation_topic(reaction.conversation_id);
        if let Err(e) = self
            .hub
            .broadcast(BroadcastMessage::to_topic(topic, reaction.to_outbound()))
        {
            warn!(error = %e, "Could not deliver relayed reaction locally");
        }
        self.peers
            .push_except(origin, &reaction_envelope(relay_kinds::REACTION_UPDATE, &reaction));

        let mut data = Map::new();
        data.insert("action".into(), reaction.action.as_str().into());
        Ok(Some(data))
    }
}

/// Peer-side handler for `join_conversation` checks. Replies with `allowed`.
pub struct JoinRelayHandler {
    authorizer: Arc<dyn Authorizer>,
}

impl JoinRelayHandler {
    #[must_use]
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl RelayHandler for JoinRelayHandler {
    async fn handle(
        &self,
        _origin: SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<Option<Map<String, Value>>, String> {
        let conversation_id = conversation(envelope)?;
        let caller = sender(envelope)?;
        let allowed = self
            .authorizer
            .authorize(&caller, conversation_id)
            .await
            .map_err(reply_error)?;

        let mut data = Map::new();
        data.insert("allowed".into(), allowed.into());
        Ok(Some(data))
    }
}

/// Peer-side handler for typing pushes: deliver locally, pass on to the
/// other gateways.
pub struct TypingRelayHandler {
    hub: HubHandle,
    peers: RelayPeers,
}

impl TypingRelayHandler {
    #[must_use]
    pub fn new(hub: HubHandle, peers: RelayPeers) -> Self {
        Self { hub, peers }
    }
}

#[async_trait]
impl RelayHandler for TypingRelayHandler {
    async fn handle(
        &self,
        origin: SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<Option<Map<String, Value>>, String> {
        let (conversation_id, caller, update) = typing_update(envelope)?;
        let is_typing = envelope
            .field("is_typing")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.peers
            .push_except(origin, &typing_envelope(conversation_id, &caller, is_typing));
        self.hub
            .broadcast(BroadcastMessage::to_topic_except(
                conversation_topic(conversation_id),
                caller,
                update,
            ))
            .map_err(|e| e.to_string())?;
        Ok(None)
    }
}

/// Peer-side store that pushes every persisted message and applied reaction
/// to all gateways.
pub struct PublishingStore {
    messages: Arc<dyn MessageStore>,
    reactions: Arc<dyn ReactionStore>,
    peers: RelayPeers,
}

impl PublishingStore {
    #[must_use]
    pub fn new(
        messages: Arc<dyn MessageStore>,
        reactions: Arc<dyn ReactionStore>,
        peers: RelayPeers,
    ) -> Self {
        Self {
            messages,
            reactions,
            peers,
        }
    }
}

#[async_trait]
impl MessageStore for PublishingStore {
    async fn persist(&self, event: &ChatEvent) -> Result<u64, CollaboratorError> {
        let id = self.messages.persist(event).await?;
        let pushed = self.peers.push_all(&chat_envelope(&event.clone().with_id(id)));
        debug!(message_id = id, gateways = pushed, "Published message to gateways");
        Ok(id)
    }
}

#[async_trait]
impl ReactionStore for PublishingStore {
    async fn apply(&self, reaction: &Reaction) -> Result<ReactionAction, CollaboratorError> {
        let action = self.reactions.apply(reaction).await?;
        let applied = Reaction {
            action,
            ..reaction.clone()
        };
        self.peers
            .push_all(&reaction_envelope(relay_kinds::REACTION_UPDATE, &applied));
        Ok(action)
    }
}
