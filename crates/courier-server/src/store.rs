//! In-process backend for running a hub without the chat service.
//!
//! Conversations listed in the config are closed to their members; any other
//! conversation is open to every authenticated caller.

use crate::config::ConversationSettings;
use async_trait::async_trait;
use courier_core::topic::parse_conversation_topic;
use courier_core::{
    Authorizer, CallerId, ChatEvent, CollaboratorError, MessageStore, Reaction, ReactionAction,
    ReactionStore, TopicDirectory,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Messages kept per process.
const HISTORY_LIMIT: usize = 10_000;

pub struct MemoryBackend {
    conversations: HashMap<u64, Vec<CallerId>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<ChatEvent>>,
    reactions: Mutex<HashSet<(u64, CallerId, String)>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(conversations: &[ConversationSettings]) -> Self {
        Self {
            conversations: conversations
                .iter()
                .map(|c| {
                    let members = c.members.iter().map(|m| CallerId::from(m.as_str())).collect();
                    (c.id, members)
                })
                .collect(),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
            reactions: Mutex::new(HashSet::new()),
        }
    }

    /// Most recent messages of a conversation, oldest first.
    #[cfg(test)]
    fn recent(&self, conversation_id: u64, limit: usize) -> Vec<ChatEvent> {
        let history = self.history.lock();
        let mut recent: Vec<ChatEvent> = history
            .iter()
            .rev()
            .filter(|e| e.conversation_id == conversation_id)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }
}

#[async_trait]
impl Authorizer for MemoryBackend {
    async fn authorize(&self, caller: &CallerId, conversation_id: u64) -> Result<bool, CollaboratorError> {
        Ok(self
            .conversations
            .get(&conversation_id)
            .map_or(true, |members| members.contains(caller)))
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn persist(&self, event: &ChatEvent) -> Result<u64, CollaboratorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock();
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event.clone().with_id(id));
        Ok(id)
    }
}

#[async_trait]
impl ReactionStore for MemoryBackend {
    async fn apply(&self, reaction: &Reaction) -> Result<ReactionAction, CollaboratorError> {
        if reaction.message_id >= self.next_id.load(Ordering::Relaxed) {
            return Err(CollaboratorError::Rejected("Unknown message".into()));
        }
        // Messages that aged out of the history are taken on trust
        let misplaced = self
            .history
            .lock()
            .iter()
            .any(|e| e.id == Some(reaction.message_id) && e.conversation_id != reaction.conversation_id);
        if misplaced {
            return Err(CollaboratorError::Rejected(format!(
                "Message {} is not in conversation {}",
                reaction.message_id, reaction.conversation_id
            )));
        }

        let key = (reaction.message_id, reaction.user.clone(), reaction.emoji.clone());
        let mut reactions = self.reactions.lock();
        if reactions.remove(&key) {
            return Ok(ReactionAction::Remove);
        }
        match reaction.action {
            ReactionAction::Add => {
                reactions.insert(key);
                Ok(ReactionAction::Add)
            }
            ReactionAction::Remove => Err(CollaboratorError::Rejected("Reaction not found".into())),
        }
    }
}

#[async_trait]
impl TopicDirectory for MemoryBackend {
    async fn members(&self, topic: &str) -> Result<Vec<CallerId>, CollaboratorError> {
        Ok(parse_conversation_topic(topic)
            .and_then(|id| self.conversations.get(&id))
            .cloned()
            .unwrap_or_default())
    }
}
