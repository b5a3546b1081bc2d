//! Built-in chat handlers.
//!
//! Conversation events fan out over the `conv:{id}` topic. Callers join a
//! conversation topic explicitly; members who are online but have not joined
//! still get `new_message` and `reaction_update` directly so their
//! conversation list stays fresh.

use crate::collaborators::{
    Authorizer, ChatEvent, Collaborators, MessageStore, Reaction, ReactionAction, ReactionStore,
    TopicDirectory, TypingForwarder,
};
use crate::connection::CallerId;
use crate::dispatch::{Dispatcher, Handler, HandlerContext, HandlerError};
use crate::hub::{BroadcastMessage, HubError, HubHandle};
use crate::topic::{conversation_topic, parse_conversation_topic, CONVERSATION_PREFIX};
use async_trait::async_trait;
use courier_protocol::{kinds, InboundMessage, OutboundMessage};
use std::sync::Arc;
use tracing::{debug, warn};

fn require_conversation(msg: &InboundMessage) -> Result<u64, HandlerError> {
    msg.conversation_id
        .ok_or_else(|| HandlerError::InvalidMessage("Missing conversation_id".into()))
}

async fn require_member(
    authorizer: &dyn Authorizer,
    ctx: &HandlerContext,
    conversation_id: u64,
) -> Result<(), HandlerError> {
    if authorizer.authorize(ctx.caller(), conversation_id).await? {
        Ok(())
    } else {
        Err(HandlerError::Unauthorized(format!(
            "Access denied to conversation {conversation_id}"
        )))
    }
}

/// Send `outbound` to members of `topic` who are online but not subscribed.
///
/// Directory failures are logged and swallowed; the topic broadcast already
/// went out.
pub(crate) async fn deliver_to_absent_members(
    hub: &HubHandle,
    directory: &dyn TopicDirectory,
    topic: &str,
    except: Option<&CallerId>,
    outbound: &Arc<OutboundMessage>,
) -> Result<(), HubError> {
    let members = match directory.members(topic).await {
        Ok(members) => members,
        Err(e) => {
            warn!(topic = %topic, error = %e, "Could not list conversation members");
            return Ok(());
        }
    };
    for member in members {
        if Some(&member) == except || !hub.is_online(&member) || hub.is_subscribed(&member, topic) {
            continue;
        }
        hub.send_to(member, outbound.clone())?;
    }
    Ok(())
}

/// `send_message`: persist, then deliver to the conversation.
pub struct SendMessageHandler {
    authorizer: Arc<dyn Authorizer>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn TopicDirectory>,
}

impl SendMessageHandler {
    #[must_use]
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            authorizer: collaborators.authorizer.clone(),
            store: collaborators.store.clone(),
            directory: collaborators.directory.clone(),
        }
    }
}

#[async_trait]
impl Handler for SendMessageHandler {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError> {
        let conversation_id = require_conversation(&msg)?;
        let content = msg
            .content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HandlerError::InvalidMessage("Message cannot be empty".into()))?;

        require_member(self.authorizer.as_ref(), ctx, conversation_id).await?;

        let event = ChatEvent::new(conversation_id, ctx.caller().clone(), content);
        let id = self.store.persist(&event).await?;
        let outbound = Arc::new(event.with_id(id).to_outbound());
        let topic = conversation_topic(conversation_id);

        ctx.hub.broadcast(BroadcastMessage::to_topic_except(
            topic.clone(),
            ctx.caller().clone(),
            outbound.clone(),
        ))?;
        ctx.reply_shared(outbound.clone());
        deliver_to_absent_members(
            &ctx.hub,
            self.directory.as_ref(),
            &topic,
            Some(ctx.caller()),
            &outbound,
        )
        .await?;

        debug!(caller = %ctx.caller(), conversation_id, message_id = id, "Message sent");
        Ok(())
    }
}

/// `join_conversation`: subscribe the caller to the conversation topic.
pub struct JoinConversationHandler {
    authorizer: Arc<dyn Authorizer>,
}

impl JoinConversationHandler {
    #[must_use]
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl Handler for JoinConversationHandler {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError> {
        let conversation_id = require_conversation(&msg)?;
        require_member(self.authorizer.as_ref(), ctx, conversation_id).await?;

        ctx.hub
            .subscribe(ctx.caller(), &conversation_topic(conversation_id))
            .await?;
        ctx.reply(OutboundMessage::joined(conversation_id));
        Ok(())
    }
}

/// `typing`: relay the indicator to the rest of the conversation.
#[derive(Default)]
pub struct TypingHandler {
    forwarder: Option<Arc<dyn TypingForwarder>>,
}

impl TypingHandler {
    /// Also hand every indicator to `forwarder` after the local broadcast.
    #[must_use]
    pub fn forwarding(forwarder: Arc<dyn TypingForwarder>) -> Self {
        Self {
            forwarder: Some(forwarder),
        }
    }
}

#[async_trait]
impl Handler for TypingHandler {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError> {
        let conversation_id = require_conversation(&msg)?;
        let topic = conversation_topic(conversation_id);
        if !ctx.hub.is_subscribed(ctx.caller(), &topic) {
            return Err(HandlerError::Unauthorized(format!(
                "Join conversation {conversation_id} first"
            )));
        }

        let is_typing = msg.is_typing.unwrap_or(false);
        let update = OutboundMessage::typing(conversation_id, ctx.caller().as_str(), is_typing);
        ctx.hub
            .broadcast(BroadcastMessage::to_topic_except(topic, ctx.caller().clone(), update))?;
        if let Some(forwarder) = &self.forwarder {
            forwarder.forward_typing(conversation_id, ctx.caller(), is_typing);
        }
        Ok(())
    }
}

/// `reaction_add` and `reaction_remove`: apply, then show the result to the
/// whole conversation, the reacting caller included.
pub struct ReactionHandler {
    action: ReactionAction,
    authorizer: Arc<dyn Authorizer>,
    reactions: Arc<dyn ReactionStore>,
    directory: Arc<dyn TopicDirectory>,
}

impl ReactionHandler {
    #[must_use]
    pub fn new(collaborators: &Collaborators, action: ReactionAction) -> Self {
        Self {
            action,
            authorizer: collaborators.authorizer.clone(),
            reactions: collaborators.reactions.clone(),
            directory: collaborators.directory.clone(),
        }
    }
}

#[async_trait]
impl Handler for ReactionHandler {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError> {
        let conversation_id = require_conversation(&msg)?;
        let (Some(message_id), Some(emoji)) = (
            msg.message_id.filter(|id| *id != 0),
            msg.emoji.as_deref().map(str::trim).filter(|e| !e.is_empty()),
        ) else {
            return Err(HandlerError::InvalidMessage("Missing message_id or emoji".into()));
        };

        require_member(self.authorizer.as_ref(), ctx, conversation_id).await?;

        let mut reaction = Reaction {
            conversation_id,
            message_id,
            user: ctx.caller().clone(),
            emoji: emoji.to_string(),
            action: self.action,
        };
        reaction.action = self.reactions.apply(&reaction).await?;

        let outbound = Arc::new(reaction.to_outbound());
        let topic = conversation_topic(conversation_id);
        ctx.hub.broadcast(BroadcastMessage::to_topic_except(
            topic.clone(),
            ctx.caller().clone(),
            outbound.clone(),
        ))?;
        ctx.reply_shared(outbound.clone());
        deliver_to_absent_members(
            &ctx.hub,
            self.directory.as_ref(),
            &topic,
            Some(ctx.caller()),
            &outbound,
        )
        .await?;

        debug!(
            caller = %ctx.caller(),
            conversation_id,
            message_id,
            action = reaction.action.as_str(),
            "Reaction applied"
        );
        Ok(())
    }
}

fn require_topic(msg: &InboundMessage) -> Result<String, HandlerError> {
    msg.data_str()
        .map(str::to_string)
        .ok_or_else(|| HandlerError::InvalidMessage("Missing topic name in data".into()))
}

/// `subscribe`: join a generic topic.
///
/// Conversation topics are held to the same membership check as
/// `join_conversation`.
pub struct SubscribeHandler {
    authorizer: Arc<dyn Authorizer>,
}

impl SubscribeHandler {
    #[must_use]
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }
}

#[async_trait]
impl Handler for SubscribeHandler {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError> {
        let topic = require_topic(&msg)?;
        if topic.starts_with(CONVERSATION_PREFIX) {
            let conversation_id = parse_conversation_topic(&topic).ok_or_else(|| {
                HandlerError::Hub(HubError::InvalidTopic("Invalid conversation topic"))
            })?;
            require_member(self.authorizer.as_ref(), ctx, conversation_id).await?;
        }
        ctx.hub.subscribe(ctx.caller(), &topic).await?;
        ctx.reply(OutboundMessage::subscription_ack(&topic));
        Ok(())
    }
}

/// `unsubscribe`: leave a generic topic.
pub struct UnsubscribeHandler;

#[async_trait]
impl Handler for UnsubscribeHandler {
    async fn handle(&self, ctx: &HandlerContext, msg: InboundMessage) -> Result<(), HandlerError> {
        let topic = require_topic(&msg)?;
        ctx.hub.unsubscribe(ctx.caller(), &topic).await?;
        ctx.reply(OutboundMessage::unsubscription_ack(&topic));
        Ok(())
    }
}

/// `ping`: application-level keep-alive.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &HandlerContext, _msg: InboundMessage) -> Result<(), HandlerError> {
        ctx.reply(OutboundMessage::pong());
        Ok(())
    }
}

/// Dispatcher with every built-in handler. `send_message` is rate-limited.
#[must_use]
pub fn default_dispatcher(collaborators: &Collaborators) -> Dispatcher {
    Dispatcher::new()
        .with_rate_limited_handler(kinds::SEND_MESSAGE, SendMessageHandler::new(collaborators))
        .with_handler(
            kinds::JOIN_CONVERSATION,
            JoinConversationHandler::new(collaborators.authorizer.clone()),
        )
        .with_handler(kinds::TYPING, TypingHandler::default())
        .with_handler(
            kinds::REACTION_ADD,
            ReactionHandler::new(collaborators, ReactionAction::Add),
        )
        .with_handler(
            kinds::REACTION_REMOVE,
            ReactionHandler::new(collaborators, ReactionAction::Remove),
        )
        .with_handler(
            kinds::SUBSCRIBE,
            SubscribeHandler::new(collaborators.authorizer.clone()),
        )
        .with_handler(kinds::UNSUBSCRIBE, UnsubscribeHandler)
        .with_handler(kinds::PING, PingHandler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use crate::connection::{CallerId, ConnectionConfig, ConnectionHandle};
    use crate::hub::{Hub, HubConfig, HubHandle};
    use crate::rate_limiter::RateLimitConfig;
    use courier_protocol::ErrorCode;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    type Inbox = Receiver<Arc<OutboundMessage>>;

    #[derive(Default)]
    struct FakeBackend {
        members: HashMap<u64, HashSet<CallerId>>,
        persisted: Mutex<Vec<ChatEvent>>,
        reactions: Mutex<HashSet<(u64, CallerId, String)>>,
        next_id: AtomicU64,
        offline: bool,
    }

    impl FakeBackend {
        fn with_conversation(mut self, id: u64, members: &[&str]) -> Self {
            self.members
                .insert(id, members.iter().map(|m| CallerId::from(*m)).collect());
            self
        }

        fn persisted(&self) -> usize {
            self.persisted.lock().len()
        }
    }

    #[async_trait]
    impl Authorizer for FakeBackend {
        async fn authorize(&self, caller: &CallerId, conversation_id: u64) -> Result<bool, CollaboratorError> {
            Ok(self
                .members
                .get(&conversation_id)
                .is_some_and(|m| m.contains(caller)))
        }
    }

    #[async_trait]
    impl MessageStore for FakeBackend {
        async fn persist(&self, event: &ChatEvent) -> Result<u64, CollaboratorError> {
            if self.offline {
                return Err(CollaboratorError::Unavailable("database offline".into()));
            }
            self.persisted.lock().push(event.clone());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl ReactionStore for FakeBackend {
        async fn apply(&self, reaction: &Reaction) -> Result<ReactionAction, CollaboratorError> {
            if self.offline {
                return Err(CollaboratorError::Unavailable("database offline".into()));
            }
            let key = (reaction.message_id, reaction.user.clone(), reaction.emoji.clone());
            let mut reactions = self.reactions.lock();
            match reaction.action {
                ReactionAction::Add if reactions.remove(&key) => Ok(ReactionAction::Remove),
                ReactionAction::Add => {
                    reactions.insert(key);
                    Ok(ReactionAction::Add)
                }
                ReactionAction::Remove if reactions.remove(&key) => Ok(ReactionAction::Remove),
                ReactionAction::Remove => Err(CollaboratorError::Rejected("Reaction not found".into())),
            }
        }
    }

    #[async_trait]
    impl TopicDirectory for FakeBackend {
        async fn members(&self, topic: &str) -> Result<Vec<CallerId>, CollaboratorError> {
            let id = crate::topic::parse_conversation_topic(topic).unwrap_or_default();
            Ok(self
                .members
                .get(&id)
                .map(|m| m.iter().cloned().collect())
                .unwrap_or_default())
        }
    }

    struct Harness {
        hub: HubHandle,
        dispatcher: Dispatcher,
        backend: Arc<FakeBackend>,
    }

    impl Harness {
        fn new(backend: FakeBackend) -> Self {
            let (hub, _task) = Hub::spawn(HubConfig {
                presence_enabled: false,
                ..HubConfig::default()
            });
            let backend = Arc::new(backend);
            let collaborators = Collaborators {
                authorizer: backend.clone(),
                store: backend.clone(),
                reactions: backend.clone(),
                directory: backend.clone(),
            };
            Self {
                hub,
                dispatcher: default_dispatcher(&collaborators),
                backend,
            }
        }

        async fn connect(&self, caller: &str) -> (HandlerContext, Inbox) {
            let config = ConnectionConfig {
                rate_limit: RateLimitConfig {
                    capacity: 10,
                    window: Duration::from_secs(60),
                },
                ..ConnectionConfig::default()
            };
            let (conn, mut rx) = ConnectionHandle::new(caller, &config);
            self.hub.register(conn.clone()).unwrap();
            self.hub.sync().await.unwrap();
            rx.try_recv().unwrap(); // connected
            (HandlerContext::new(self.hub.clone(), conn), rx)
        }

        async fn send(&self, ctx: &HandlerContext, msg: InboundMessage) {
            self.dispatcher.dispatch(ctx, msg).await;
            self.hub.sync().await.unwrap();
        }
    }

    fn drain(inbox: &mut Inbox) -> Vec<Arc<OutboundMessage>> {
        let mut out = Vec::new();
        while let Ok(msg) = inbox.try_recv() {
            out.push(msg);
        }
        out
    }

    fn join(id: u64) -> InboundMessage {
        InboundMessage::new(kinds::JOIN_CONVERSATION).with_conversation(id)
    }

    fn chat(id: u64, text: &str) -> InboundMessage {
        InboundMessage::new(kinds::SEND_MESSAGE)
            .with_conversation(id)
            .with_content(text)
    }

    fn react(kind: &str, id: u64, message_id: u64, emoji: &str) -> InboundMessage {
        InboundMessage::new(kind)
            .with_conversation(id)
            .with_reaction(message_id, emoji)
    }

    #[derive(Default)]
    struct RecordingForwarder(Mutex<Vec<(u64, CallerId, bool)>>);

    impl TypingForwarder for RecordingForwarder {
        fn forward_typing(&self, conversation_id: u64, caller: &CallerId, is_typing: bool) {
            self.0.lock().push((conversation_id, caller.clone(), is_typing));
        }
    }

    #[tokio::test]
    async fn test_send_message_fans_out_excluding_sender() {
        let h = Harness::new(FakeBackend::default().with_conversation(42, &["u1", "u2"]));
        let (u1, mut inbox1) = h.connect("u1").await;
        let (u2, mut inbox2) = h.connect("u2").await;
        h.send(&u1, join(42)).await;
        h.send(&u2, join(42)).await;
        assert_eq!(drain(&mut inbox1)[0].kind, kinds::JOINED);
        drain(&mut inbox2);

        h.send(&u1, chat(42, "hello")).await;

        // Sender gets exactly one echo, not a second copy through the topic
        let echoed = drain(&mut inbox1);
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].kind, kinds::NEW_MESSAGE);

        let received = drain(&mut inbox2);
        assert_eq!(received.len(), 1);
        let data = received[0].data.as_ref().unwrap();
        assert_eq!(data["message"], "hello");
        assert_eq!(data["sender_id"], "u1");
        assert_eq!(data["id"], 1);
        assert_eq!(h.backend.persisted(), 1);
    }

    #[tokio::test]
    async fn test_send_message_reaches_members_who_did_not_join() {
        let h = Harness::new(FakeBackend::default().with_conversation(7, &["u1", "u2", "u3"]));
        let (u1, mut inbox1) = h.connect("u1").await;
        let (_u2, mut inbox2) = h.connect("u2").await;
        h.send(&u1, join(7)).await;
        drain(&mut inbox1);

        h.send(&u1, chat(7, "ping")).await;

        // u2 is online but never joined; u3 is offline
        let received = drain(&mut inbox2);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].conversation_id, Some(7));
    }

    #[tokio::test]
    async fn test_eleventh_message_is_rate_limited_without_persist() {
        let h = Harness::new(FakeBackend::default().with_conversation(1, &["u1"]));
        let (u1, mut inbox) = h.connect("u1").await;

        for i in 0..11 {
            h.send(&u1, chat(1, &format!("message {i}"))).await;
        }

        let replies = drain(&mut inbox);
        assert_eq!(replies.len(), 11);
        assert!(replies[..10].iter().all(|m| m.kind == kinds::NEW_MESSAGE));
        assert_eq!(replies[10].error_code(), Some(ErrorCode::RateLimited));
        assert_eq!(h.backend.persisted(), 10);
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let h = Harness::new(FakeBackend::default().with_conversation(1, &["u1"]));
        let (u1, mut inbox) = h.connect("u1").await;

        h.send(&u1, InboundMessage::new(kinds::SEND_MESSAGE).with_content("x")).await;
        h.send(&u1, chat(1, "   ")).await;
        h.send(&u1, chat(2, "not a member")).await;

        let codes: Vec<_> = drain(&mut inbox).iter().map(|m| m.error_code()).collect();
        assert_eq!(
            codes,
            vec![
                Some(ErrorCode::InvalidMessage),
                Some(ErrorCode::InvalidMessage),
                Some(ErrorCode::Unauthorized),
            ]
        );
        assert_eq!(h.backend.persisted(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_reports_service_unavailable() {
        let backend = FakeBackend {
            offline: true,
            ..FakeBackend::default()
        }
        .with_conversation(1, &["u1", "u2"]);
        let h = Harness::new(backend);
        let (u1, mut inbox1) = h.connect("u1").await;
        let (u2, mut inbox2) = h.connect("u2").await;
        h.send(&u2, join(1)).await;
        drain(&mut inbox2);

        h.send(&u1, chat(1, "lost")).await;

        assert_eq!(
            drain(&mut inbox1)[0].error_code(),
            Some(ErrorCode::ServiceUnavailable)
        );
        assert!(drain(&mut inbox2).is_empty());
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let h = Harness::new(FakeBackend::default().with_conversation(1, &["u1"]));
        let (u2, mut inbox) = h.connect("u2").await;

        h.send(&u2, join(1)).await;

        assert_eq!(drain(&mut inbox)[0].error_code(), Some(ErrorCode::Unauthorized));
        assert!(!h.hub.topic_exists("conv:1"));
    }

    #[tokio::test]
    async fn test_typing_goes_to_others() {
        let h = Harness::new(FakeBackend::default().with_conversation(3, &["u1", "u2"]));
        let (u1, mut inbox1) = h.connect("u1").await;
        let (u2, mut inbox2) = h.connect("u2").await;
        h.send(&u1, join(3)).await;
        h.send(&u2, join(3)).await;
        drain(&mut inbox1);
        drain(&mut inbox2);

        h.send(
            &u1,
            InboundMessage::new(kinds::TYPING)
                .with_conversation(3)
                .with_typing(true),
        )
        .await;

        assert!(drain(&mut inbox1).is_empty());
        let received = drain(&mut inbox2);
        assert_eq!(received[0].kind, kinds::TYPING);
        assert_eq!(received[0].data.as_ref().unwrap()["is_typing"], true);
    }

    #[tokio::test]
    async fn test_typing_before_join_is_rejected() {
        let h = Harness::new(FakeBackend::default().with_conversation(3, &["u1"]));
        let (u1, mut inbox) = h.connect("u1").await;

        h.send(&u1, InboundMessage::new(kinds::TYPING).with_conversation(3)).await;
        assert_eq!(drain(&mut inbox)[0].error_code(), Some(ErrorCode::Unauthorized));
    }

    #[tokio::test]
    async fn test_generic_subscriptions() {
        let h = Harness::new(FakeBackend::default());
        let (u1, mut inbox) = h.connect("u1").await;

        h.send(&u1, InboundMessage::new(kinds::SUBSCRIBE).with_data(json!("alerts"))).await;
        h.send(&u1, InboundMessage::new(kinds::SUBSCRIBE).with_data(json!("no spaces!"))).await;
        h.send(&u1, InboundMessage::new(kinds::SUBSCRIBE)).await;
        h.send(&u1, InboundMessage::new(kinds::UNSUBSCRIBE).with_data(json!("alerts"))).await;
        h.send(&u1, InboundMessage::new(kinds::PING)).await;

        let replies = drain(&mut inbox);
        assert_eq!(replies[0].kind, kinds::SUBSCRIPTION_ACK);
        assert_eq!(replies[0].data.as_ref().unwrap()["channel"], "alerts");
        assert_eq!(replies[1].error_code(), Some(ErrorCode::InvalidTarget));
        assert_eq!(replies[2].error_code(), Some(ErrorCode::InvalidMessage));
        assert_eq!(replies[3].kind, kinds::UNSUBSCRIPTION_ACK);
        assert_eq!(replies[4].kind, kinds::PONG);
        assert!(!h.hub.topic_exists("alerts"));
    }

    #[tokio::test]
    async fn test_subscribe_to_conversation_topic_requires_membership() {
        let h = Harness::new(FakeBackend::default().with_conversation(42, &["u1"]));
        let (u1, mut inbox1) = h.connect("u1").await;
        let (mallory, mut inbox_m) = h.connect("mallory").await;
        h.send(&u1, join(42)).await;
        drain(&mut inbox1);

        h.send(&mallory, join(42)).await;
        h.send(&mallory, InboundMessage::new(kinds::SUBSCRIBE).with_data(json!("conv:42"))).await;
        h.send(&mallory, InboundMessage::new(kinds::SUBSCRIBE).with_data(json!("conv:abc"))).await;

        let replies = drain(&mut inbox_m);
        assert_eq!(replies[0].error_code(), Some(ErrorCode::Unauthorized));
        assert_eq!(replies[1].error_code(), Some(ErrorCode::Unauthorized));
        assert_eq!(replies[2].error_code(), Some(ErrorCode::InvalidTarget));
        assert!(!h.hub.is_subscribed(&CallerId::from("mallory"), "conv:42"));

        h.send(&u1, chat(42, "secret")).await;
        assert!(drain(&mut inbox_m).is_empty());

        // Members may still use the generic path
        h.send(&u1, InboundMessage::new(kinds::SUBSCRIBE).with_data(json!("conv:42"))).await;
        let replies = drain(&mut inbox1);
        assert_eq!(replies.last().unwrap().kind, kinds::SUBSCRIPTION_ACK);
    }

    #[tokio::test]
    async fn test_reaction_reaches_whole_conversation() {
        let h = Harness::new(FakeBackend::default().with_conversation(5, &["u1", "u2", "u3"]));
        let (u1, mut inbox1) = h.connect("u1").await;
        let (u2, mut inbox2) = h.connect("u2").await;
        let (_u3, mut inbox3) = h.connect("u3").await;
        h.send(&u1, join(5)).await;
        h.send(&u2, join(5)).await;
        drain(&mut inbox1);
        drain(&mut inbox2);

        h.send(&u1, react(kinds::REACTION_ADD, 5, 9, "+1")).await;

        // Reacting caller, joined member and online member who never joined
        for inbox in [&mut inbox1, &mut inbox2, &mut inbox3] {
            let received = drain(inbox);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].kind, kinds::REACTION_UPDATE);
            let data = received[0].data.as_ref().unwrap();
            assert_eq!(data["message_id"], 9);
            assert_eq!(data["user_id"], "u1");
            assert_eq!(data["action"], "add");
        }
    }

    #[tokio::test]
    async fn test_repeated_reaction_toggles_off() {
        let h = Harness::new(FakeBackend::default().with_conversation(5, &["u1"]));
        let (u1, mut inbox) = h.connect("u1").await;

        h.send(&u1, react(kinds::REACTION_ADD, 5, 9, "+1")).await;
        h.send(&u1, react(kinds::REACTION_ADD, 5, 9, "+1")).await;
        h.send(&u1, react(kinds::REACTION_REMOVE, 5, 9, "+1")).await;

        let replies = drain(&mut inbox);
        assert_eq!(replies[0].data.as_ref().unwrap()["action"], "add");
        assert_eq!(replies[1].data.as_ref().unwrap()["action"], "remove");
        assert_eq!(replies[2].error_code(), Some(ErrorCode::ServiceUnavailable));
    }

    #[tokio::test]
    async fn test_reaction_validation() {
        let h = Harness::new(FakeBackend::default().with_conversation(5, &["u1"]));
        let (u1, mut inbox) = h.connect("u1").await;
        let (u2, mut inbox2) = h.connect("u2").await;

        h.send(&u1, react(kinds::REACTION_ADD, 5, 9, "  ")).await;
        h.send(&u1, InboundMessage::new(kinds::REACTION_ADD).with_reaction(9, "+1")).await;
        h.send(&u2, react(kinds::REACTION_ADD, 5, 9, "+1")).await;

        let codes: Vec<_> = drain(&mut inbox).iter().map(|m| m.error_code()).collect();
        assert_eq!(
            codes,
            vec![Some(ErrorCode::InvalidMessage), Some(ErrorCode::InvalidMessage)]
        );
        assert_eq!(drain(&mut inbox2)[0].error_code(), Some(ErrorCode::Unauthorized));
        assert!(h.backend.reactions.lock().is_empty());
    }

    #[tokio::test]
    async fn test_typing_is_forwarded() {
        let mut h = Harness::new(FakeBackend::default().with_conversation(3, &["u1"]));
        let forwarder = Arc::new(RecordingForwarder::default());
        h.dispatcher = h
            .dispatcher
            .with_handler(kinds::TYPING, TypingHandler::forwarding(forwarder.clone()));
        let (u1, mut inbox) = h.connect("u1").await;
        h.send(&u1, join(3)).await;
        drain(&mut inbox);

        h.send(
            &u1,
            InboundMessage::new(kinds::TYPING)
                .with_conversation(3)
                .with_typing(true),
        )
        .await;
        h.send(&u1, InboundMessage::new(kinds::TYPING).with_conversation(4)).await;

        // Only the indicator that passed the join check leaves the hub
        assert_eq!(*forwarder.0.lock(), vec![(3, CallerId::from("u1"), true)]);
    }
}
