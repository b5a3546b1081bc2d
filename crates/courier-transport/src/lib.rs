//! # courier-transport
//!
//! Transport abstraction layer for the Courier hubs.
//!
//! A live stream is handed to the core as two independent halves so that the
//! read pump and the write pump can each own one:
//!
//! - [`FrameReader`] - yields inbound [`WireFrame`]s one at a time
//! - [`FrameWriter`] - the only path to the outbound side of the stream
//!
//! Implementations:
//!
//! - **axum** - server side of an upgraded client or relay connection
//! - **tokio-tungstenite** - client side of the relay link ([`WebSocketConnector`])
//! - **memory** - in-process pipes for tests and embedding
//!
//! ```rust,ignore
//! use courier_transport::{FrameReader, WireFrame};
//!
//! async fn drain(mut reader: Box<dyn FrameReader>) {
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         if let WireFrame::Text(text) = frame {
//!             println!("{text}");
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{duplex, pipe, MemoryEndpoint};
pub use traits::{
    BoxReader, BoxWriter, Connector, FrameReader, FrameWriter, TransportError, WireFrame,
};

#[cfg(feature = "websocket")]
pub use websocket::{split_axum, WebSocketConnector};
