//! Transport abstraction traits for Courier.
//!
//! These traits define the interface that all transport implementations must
//! provide, allowing the hubs to be transport-agnostic.

use async_trait::async_trait;
use thiserror::Error;

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// A UTF-8 text frame carrying one JSON envelope.
    Text(String),
    /// A binary frame. Courier envelopes never use these.
    Binary(Vec<u8>),
    /// Keep-alive ping.
    Ping(Vec<u8>),
    /// Keep-alive pong.
    Pong(Vec<u8>),
    /// Orderly close.
    Close,
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to establish an outbound connection.
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The inbound half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer closed the stream cleanly.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// The outbound half of a connection.
///
/// Exactly one task owns a writer, so implementations never see concurrent
/// calls.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send a frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Close the stream gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: FrameReader + ?Sized> FrameReader for Box<T> {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        (**self).recv().await
    }
}

#[async_trait]
impl<T: FrameWriter + ?Sized> FrameWriter for Box<T> {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}

/// Boxed inbound half.
pub type BoxReader = Box<dyn FrameReader>;

/// Boxed outbound half.
pub type BoxWriter = Box<dyn FrameWriter>;

/// Something that can open an outbound connection, such as the relay link.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection and return its two halves.
    async fn connect(&self) -> Result<(BoxReader, BoxWriter), TransportError>;

    /// Human-readable description of the remote end, for logs.
    fn target(&self) -> String;
}
