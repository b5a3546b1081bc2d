//! JSON codec for Courier envelopes.
//!
//! Every envelope travels as one WebSocket text frame. Frames larger than
//! [`MAX_FRAME_SIZE`] are rejected before parsing.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::{InboundMessage, OutboundMessage};
use crate::relay::RelayEnvelope;

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON syntax or shape error.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The `type` field is empty.
    #[error("Missing message type")]
    MissingType,
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(value)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a client frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, not valid JSON, or has an
/// empty type.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let msg: InboundMessage = decode(text)?;
    if msg.kind.is_empty() {
        return Err(ProtocolError::MissingType);
    }
    Ok(msg)
}

/// Encode a frame for a client.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode_outbound(msg: &OutboundMessage) -> Result<String, ProtocolError> {
    encode(msg)
}

/// Decode a relay frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, not valid JSON, or has an
/// empty type.
pub fn decode_relay(text: &str) -> Result<RelayEnvelope, ProtocolError> {
    let env: RelayEnvelope = decode(text)?;
    if env.kind.is_empty() {
        return Err(ProtocolError::MissingType);
    }
    Ok(env)
}

/// Encode a relay frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode_relay(env: &RelayEnvelope) -> Result<String, ProtocolError> {
    encode(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::kinds;

    #[test]
    fn test_decode_inbound() {
        let msg = decode_inbound(r#"{"type":"join_conversation","conversation_id":42}"#).unwrap();
        assert_eq!(msg.kind, kinds::JOIN_CONVERSATION);
        assert_eq!(msg.conversation_id, Some(42));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        assert!(matches!(
            decode_inbound(r#"{"conversation_id":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_inbound(r#"{"type":""}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_inbound("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_inbound(r#"{"type":"typing","conversation_id":"abc"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let content = "x".repeat(MAX_FRAME_SIZE);
        let text = format!(r#"{{"type":"send_message","content":"{content}"}}"#);
        match decode_inbound(&text) {
            Err(ProtocolError::FrameTooLarge(size)) => assert_eq!(size, text.len()),
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_relay_decode() {
        let env = decode_relay(
            r#"{"type":"chat_message","request_id":"req_1","status":"error","error":"denied"}"#,
        )
        .unwrap();
        assert!(env.is_reply());
        assert_eq!(env.error.as_deref(), Some("denied"));

        let text = encode_relay(&env).unwrap();
        assert_eq!(decode_relay(&text).unwrap(), env);
    }
}
