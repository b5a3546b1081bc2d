//! Topic naming rules.

/// Maximum length of a topic name.
pub const MAX_TOPIC_NAME_LENGTH: usize = 50;

/// Prefix of per-conversation topics.
pub const CONVERSATION_PREFIX: &str = "conv:";

/// Validate a topic name.
///
/// Names are 1 to 50 ASCII characters drawn from letters, digits, `_`, `-`,
/// `:` and `.`.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
    {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

/// Topic carrying the events of one conversation.
#[must_use]
pub fn conversation_topic(conversation_id: u64) -> String {
    format!("{CONVERSATION_PREFIX}{conversation_id}")
}

/// Extract the conversation id from a conversation topic.
#[must_use]
pub fn parse_conversation_topic(topic: &str) -> Option<u64> {
    topic.strip_prefix(CONVERSATION_PREFIX)?.parse().ok()
}
