//! WebSocket transport implementation.
//!
//! Server-side streams come from axum's upgrade extractor and are split with
//! [`split_axum`]. The relay link dials out with tokio-tungstenite through
//! [`WebSocketConnector`].

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::traits::{BoxReader, BoxWriter, Connector, FrameReader, FrameWriter, TransportError, WireFrame};

/// Inbound half of an upgraded axum socket.
pub struct AxumReader {
    stream: SplitStream<WebSocket>,
}

/// Outbound half of an upgraded axum socket.
pub struct AxumWriter {
    sink: SplitSink<WebSocket, AxumMessage>,
}

/// Split an upgraded axum socket into a reader and a writer.
#[must_use]
pub fn split_axum(socket: WebSocket) -> (AxumReader, AxumWriter) {
    let (sink, stream) = socket.split();
    (AxumReader { stream }, AxumWriter { sink })
}

#[async_trait]
impl FrameReader for AxumReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.stream.next().await {
            Some(Ok(AxumMessage::Text(text))) => Ok(Some(WireFrame::Text(text))),
            Some(Ok(AxumMessage::Binary(data))) => Ok(Some(WireFrame::Binary(data))),
            Some(Ok(AxumMessage::Ping(data))) => Ok(Some(WireFrame::Ping(data))),
            Some(Ok(AxumMessage::Pong(data))) => Ok(Some(WireFrame::Pong(data))),
            Some(Ok(AxumMessage::Close(frame))) => {
                debug!(?frame, "peer sent close frame");
                Ok(None)
            }
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FrameWriter for AxumWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let msg = match frame {
            WireFrame::Text(text) => AxumMessage::Text(text),
            WireFrame::Binary(data) => AxumMessage::Binary(data),
            WireFrame::Ping(data) => AxumMessage::Ping(data),
            WireFrame::Pong(data) => AxumMessage::Pong(data),
            WireFrame::Close => AxumMessage::Close(None),
        };
        self.sink
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound half of an outbound tungstenite connection.
pub struct TungsteniteReader {
    stream: SplitStream<ClientStream>,
}

/// Outbound half of an outbound tungstenite connection.
pub struct TungsteniteWriter {
    sink: SplitSink<ClientStream, Message>,
}

#[async_trait]
impl FrameReader for TungsteniteReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                Some(Ok(Message::Binary(data))) => WireFrame::Binary(data),
                Some(Ok(Message::Ping(data))) => WireFrame::Ping(data),
                Some(Ok(Message::Pong(data))) => WireFrame::Pong(data),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "relay peer sent close frame");
                    return Ok(None);
                }
                // Raw frames are never surfaced while reading
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };
            return Ok(Some(frame));
        }
    }
}

#[async_trait]
impl FrameWriter for TungsteniteWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let msg = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data),
            WireFrame::Ping(data) => Message::Ping(data),
            WireFrame::Pong(data) => Message::Pong(data),
            WireFrame::Close => Message::Close(None),
        };
        self.sink.send(msg).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
            other => TransportError::SendFailed(other.to_string()),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

/// Dials a WebSocket endpoint, attaching fixed headers to the handshake.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    headers: Vec<(String, String)>,
}

impl WebSocketConnector {
    /// Create a connector for the given `ws://` or `wss://` URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Add a header sent with every handshake.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<(BoxReader, BoxWriter), TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        trace!(status = %response.status(), url = %self.url, "WebSocket handshake completed");

        let (sink, stream) = stream.split();
        Ok((
            Box::new(TungsteniteReader { stream }),
            Box::new(TungsteniteWriter { sink }),
        ))
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}
