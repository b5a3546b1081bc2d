//! # courier-protocol
//!
//! Wire envelopes for the Courier realtime hubs.
//!
//! Two links share this crate:
//!
//! - **Client link** - JSON text frames between a browser client and a hub
//!   ([`InboundMessage`] in, [`OutboundMessage`] out)
//! - **Relay link** - JSON text frames between the gateway hub and the peer
//!   hub ([`RelayEnvelope`] both ways, correlated by `request_id`)
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, OutboundMessage};
//!
//! let frame = codec::decode_inbound(r#"{"type":"typing","conversation_id":42,"is_typing":true}"#).unwrap();
//! assert_eq!(frame.kind, "typing");
//!
//! let reply = OutboundMessage::typing(42, "u1", true);
//! let text = codec::encode_outbound(&reply).unwrap();
//! assert!(text.contains("\"timestamp\""));
//! ```

pub mod codec;
pub mod envelope;
pub mod relay;

pub use codec::{
    decode_inbound, decode_relay, encode_outbound, encode_relay, ProtocolError, MAX_FRAME_SIZE,
};
pub use envelope::{kinds, ErrorCode, InboundMessage, OutboundMessage};
pub use relay::{relay_kinds, RelayEnvelope, RelayStatus};
