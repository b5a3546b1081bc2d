//! Accepting side of the relay link.

use super::client::RelayConfig;
use crate::pump::{next_frame, write_pump, PumpConfig};
use crate::queue::OutboundQueue;
use async_trait::async_trait;
use courier_protocol::{codec, RelayEnvelope};
use courier_transport::{FrameReader, FrameWriter, WireFrame};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies one accepted relay session.
pub type SessionId = u64;

/// Handles one relay envelope type.
///
/// `Ok(data)` becomes a success reply carrying `data`, `Err(message)` an
/// error reply. Either is discarded when the sender did not ask for a reply.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    async fn handle(
        &self,
        origin: SessionId,
        envelope: &RelayEnvelope,
    ) -> Result<Option<Map<String, Value>>, String>;
}

/// Routes relay envelopes to handlers by type.
#[derive(Default)]
pub struct RelayRouter {
    handlers: HashMap<String, Arc<dyn RelayHandler>>,
}

impl RelayRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, kind: impl Into<String>, handler: impl RelayHandler + 'static) -> Self {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    /// Handle `envelope` and build the reply, if one is expected.
    pub async fn route(&self, origin: SessionId, envelope: RelayEnvelope) -> Option<RelayEnvelope> {
        if envelope.is_reply() {
            debug!(session = origin, kind = %envelope.kind, "Dropping reply sent to relay server");
            return None;
        }

        let Some(handler) = self.handlers.get(&envelope.kind) else {
            if envelope.expects_reply() {
                return Some(envelope.failure(format!("Unknown message type: {}", envelope.kind)));
            }
            warn!(session = origin, kind = %envelope.kind, "Dropping relay envelope of unknown type");
            return None;
        };

        let result = handler.handle(origin, &envelope).await;
        if !envelope.expects_reply() {
            if let Err(e) = result {
                warn!(session = origin, kind = %envelope.kind, error = %e, "Relay push failed");
            }
            return None;
        }

        Some(match result {
            Ok(data) => {
                let mut reply = envelope.success();
                reply.data = data;
                reply
            }
            Err(e) => envelope.failure(e),
        })
    }
}

/// Live relay sessions, for pushing unsolicited envelopes to gateways.
#[derive(Clone, Default)]
pub struct RelayPeers {
    sessions: Arc<DashMap<SessionId, Arc<OutboundQueue<RelayEnvelope>>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayPeers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, queue: Arc<OutboundQueue<RelayEnvelope>>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.insert(id, queue);
        id
    }

    fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Push to every session. Returns how many accepted it.
    pub fn push_all(&self, envelope: &RelayEnvelope) -> usize {
        self.push_filtered(None, envelope)
    }

    /// Push to every session except `origin`.
    pub fn push_except(&self, origin: SessionId, envelope: &RelayEnvelope) -> usize {
        self.push_filtered(Some(origin), envelope)
    }

    fn push_filtered(&self, skip: Option<SessionId>, envelope: &RelayEnvelope) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.sessions.iter() {
            if Some(*entry.key()) == skip {
                continue;
            }
            if entry.value().try_send(envelope.clone()) {
                delivered += 1;
            } else {
                failed.push(*entry.key());
            }
        }

        // A session that cannot keep up is dropped; the gateway reconnects
        for id in failed {
            if let Some((_, queue)) = self.sessions.remove(&id) {
                queue.close();
                warn!(session = id, "Relay session send queue full, closing");
            }
        }
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Serves accepted relay streams.
#[derive(Clone)]
pub struct RelaySession {
    router: Arc<RelayRouter>,
    peers: RelayPeers,
    config: RelayConfig,
}

impl RelaySession {
    #[must_use]
    pub fn new(router: Arc<RelayRouter>, peers: RelayPeers, config: RelayConfig) -> Self {
        Self { router, peers, config }
    }

    #[must_use]
    pub fn peers(&self) -> &RelayPeers {
        &self.peers
    }

    /// Serve one stream until it closes. Each request is handled on its own
    /// task so a slow handler does not stall the stream.
    pub async fn serve<R, W>(&self, mut reader: R, writer: W)
    where
        R: FrameReader,
        W: FrameWriter + 'static,
    {
        let pump = PumpConfig {
            ping_interval: self.config.ping_interval,
            idle_timeout: self.config.idle_timeout,
            write_timeout: self.config.write_timeout,
        };
        let (queue, rx) = OutboundQueue::bounded(self.config.outbound_capacity);
        let queue = Arc::new(queue);
        let id = self.peers.insert(queue.clone());
        let peer = format!("relay-session-{id}");

        let done = CancellationToken::new();
        let writer_task = tokio::spawn(write_pump(
            rx,
            writer,
            codec::encode_relay,
            pump,
            done.clone(),
            peer.clone(),
        ));
        info!(session = id, sessions = self.peers.len(), "Relay session opened");

        while let Some(frame) = next_frame(&mut reader, pump.idle_timeout, &done, &peer).await {
            match frame {
                WireFrame::Text(text) => match codec::decode_relay(&text) {
                    Ok(envelope) => {
                        let router = self.router.clone();
                        let queue = queue.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = router.route(id, envelope).await {
                                if !queue.try_send(reply) {
                                    debug!(session = id, "Relay reply dropped, session gone");
                                }
                            }
                        });
                    }
                    Err(e) => warn!(session = id, error = %e, "Dropping undecodable relay frame"),
                },
                WireFrame::Close => break,
                WireFrame::Binary(_) | WireFrame::Ping(_) | WireFrame::Pong(_) => {}
            }
        }

        self.peers.remove(id);
        queue.close();
        let _ = writer_task.await;
        info!(session = id, "Relay session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::RelayStatus;
    use courier_transport::memory::{duplex, MemoryEndpoint};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RelayHandler for Echo {
        async fn handle(
            &self,
            origin: SessionId,
            envelope: &RelayEnvelope,
        ) -> Result<Option<Map<String, Value>>, String> {
            match envelope.field("content").and_then(Value::as_str) {
                Some("fail") => Err("rejected".into()),
                Some(content) => {
                    let mut data = Map::new();
                    data.insert("echo".into(), json!(content));
                    data.insert("origin".into(), json!(origin));
                    Ok(Some(data))
                }
                None => Ok(None),
            }
        }
    }

    fn router() -> Arc<RelayRouter> {
        Arc::new(RelayRouter::new().with_handler("echo", Echo))
    }

    fn request(content: &str) -> RelayEnvelope {
        RelayEnvelope::new("echo")
            .with_request_id("req-1")
            .with_field("content", content)
    }

    async fn read_envelope(end: &mut MemoryEndpoint) -> Option<RelayEnvelope> {
        loop {
            match end.reader.recv().await.unwrap()? {
                WireFrame::Text(text) => return Some(codec::decode_relay(&text).unwrap()),
                _ => continue,
            }
        }
    }

    async fn write_envelope(end: &mut MemoryEndpoint, envelope: &RelayEnvelope) {
        let text = codec::encode_relay(envelope).unwrap();
        end.writer.send(WireFrame::Text(text)).await.unwrap();
    }

    #[tokio::test]
    async fn test_route_success_reply() {
        let reply = router().route(7, request("hi")).await.unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("req-1"));
        assert_eq!(reply.status, Some(RelayStatus::Success));
        assert_eq!(reply.field("echo"), Some(&json!("hi")));
        assert_eq!(reply.field("origin"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn test_route_error_reply() {
        let reply = router().route(1, request("fail")).await.unwrap();
        assert_eq!(reply.status, Some(RelayStatus::Error));
        assert_eq!(reply.error.as_deref(), Some("rejected"));
    }

    #[tokio::test]
    async fn test_route_unknown_type() {
        let router = router();
        let reply = router
            .route(1, RelayEnvelope::new("bogus").with_request_id("r"))
            .await
            .unwrap();
        assert_eq!(reply.status, Some(RelayStatus::Error));
        assert!(reply.error.unwrap().contains("bogus"));

        assert!(router.route(1, RelayEnvelope::new("bogus")).await.is_none());
    }

    #[tokio::test]
    async fn test_route_push_gets_no_reply() {
        let push = RelayEnvelope::new("echo").with_field("content", "fail");
        assert!(router().route(1, push).await.is_none());

        let stray_reply = request("hi").success();
        assert!(router().route(1, stray_reply).await.is_none());
    }

    #[tokio::test]
    async fn test_push_except_skips_origin_and_drops_full_sessions() {
        let peers = RelayPeers::new();
        let (a, mut a_rx) = OutboundQueue::bounded(4);
        let (b, mut b_rx) = OutboundQueue::bounded(4);
        let (c, _c_rx) = OutboundQueue::bounded(1);
        let a = peers.insert(Arc::new(a));
        peers.insert(Arc::new(b));
        let c_queue = Arc::new(c);
        peers.insert(c_queue.clone());
        assert!(c_queue.try_send(RelayEnvelope::new("filler")));

        let push = RelayEnvelope::new("chat_message");
        assert_eq!(peers.push_except(a, &push), 1);
        assert_eq!(b_rx.recv().await.unwrap(), push);
        assert!(a_rx.try_recv().is_err());

        // The full session was dropped and closed
        assert_eq!(peers.len(), 2);
        assert!(c_queue.is_closed());

        assert_eq!(peers.push_all(&push), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_serves_requests_and_unregisters() {
        let (mut gateway, server) = duplex();
        let peers = RelayPeers::new();
        let session = RelaySession::new(router(), peers.clone(), RelayConfig::default());
        let task = tokio::spawn(async move { session.serve(server.reader, server.writer).await });

        write_envelope(&mut gateway, &request("hello")).await;
        let reply = read_envelope(&mut gateway).await.unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("req-1"));
        assert_eq!(reply.field("echo"), Some(&json!("hello")));
        assert_eq!(peers.len(), 1);

        // Pushes reach the gateway
        assert_eq!(peers.push_all(&RelayEnvelope::new("chat_message")), 1);
        assert_eq!(read_envelope(&mut gateway).await.unwrap().kind, "chat_message");

        gateway.writer.close().await.unwrap();
        task.await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_idle_deadline() {
        let (_gateway, server) = duplex();
        let peers = RelayPeers::new();
        let session = RelaySession::new(router(), peers.clone(), RelayConfig::default());

        let start = tokio::time::Instant::now();
        session.serve(server.reader, server.writer).await;
        assert!(start.elapsed() >= RelayConfig::default().idle_timeout);
        assert!(peers.is_empty());
    }
}
