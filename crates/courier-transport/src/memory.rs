//! In-memory transport.
//!
//! [`duplex`] returns two connected endpoints; whatever one side writes the
//! other side reads. Used by tests and by embedders that run both hubs in a
//! single process.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Reading end of an in-memory pipe.
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<WireFrame>,
}

/// Writing end of an in-memory pipe.
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<WireFrame>>,
}

/// One side of a [`duplex`] connection.
pub struct MemoryEndpoint {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

/// Create a one-way pipe.
#[must_use]
pub fn pipe() -> (MemoryWriter, MemoryReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryWriter { tx: Some(tx) }, MemoryReader { rx })
}

/// Create two connected endpoints.
#[must_use]
pub fn duplex() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_writer, b_reader) = pipe();
    let (b_writer, a_reader) = pipe();
    (
        MemoryEndpoint {
            reader: a_reader,
            writer: a_writer,
        },
        MemoryEndpoint {
            reader: b_reader,
            writer: b_writer,
        },
    )
}

impl MemoryWriter {
    /// Whether the reading end is still alive.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.rx.recv().await {
            Some(WireFrame::Close) | None => Ok(None),
            Some(frame) => Ok(Some(frame)),
        }
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WireFrame::Close);
        }
        Ok(())
    }
}
