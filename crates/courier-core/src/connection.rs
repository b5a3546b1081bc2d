//! Per-connection actor.
//!
//! A connection is split into two tasks that never share the stream:
//!
//! - the **write pump** owns the writer, drains the outbound queue, and
//!   interleaves keep-alive pings
//! - the **read pump** owns the reader, enforces the idle deadline, and
//!   dispatches each decoded frame
//!
//! The hub only ever touches a connection through its [`ConnectionHandle`].

use crate::dispatch::{Dispatcher, HandlerContext};
use crate::hub::HubHandle;
use crate::pump::{next_frame, write_pump, PumpConfig};
use crate::queue::OutboundQueue;
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use chrono::{DateTime, Utc};
use courier_protocol::{codec, ErrorCode, OutboundMessage};
use courier_transport::{FrameReader, FrameWriter, WireFrame};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Authenticated identity behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for CallerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// Close the connection after this long without any inbound frame.
    pub idle_timeout: Duration,
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// Deadline for a single write.
    pub write_timeout: Duration,
    /// Limit for rate-limited message types.
    pub rate_limit: RateLimitConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Shared handle to one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    serial: u64,
    caller: CallerId,
    queue: OutboundQueue<Arc<OutboundMessage>>,
    /// Mirror of the hub's topic table for this connection.
    subscriptions: Mutex<HashSet<String>>,
    last_activity: Mutex<Instant>,
    rate_limiter: RateLimiter,
    /// Cancelled when the write pump exits.
    cancel: CancellationToken,
    unregistered: AtomicBool,
    connected_at: DateTime<Utc>,
    keepalive: PumpConfig,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its write pump drains.
    #[must_use]
    pub fn new(
        caller: impl Into<CallerId>,
        config: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<OutboundMessage>>) {
        let (queue, rx) = OutboundQueue::bounded(config.outbound_capacity);
        let handle = Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            caller: caller.into(),
            queue,
            subscriptions: Mutex::new(HashSet::new()),
            last_activity: Mutex::new(Instant::now()),
            rate_limiter: RateLimiter::new(config.rate_limit),
            cancel: CancellationToken::new(),
            unregistered: AtomicBool::new(false),
            connected_at: Utc::now(),
            keepalive: PumpConfig {
                ping_interval: config.ping_interval,
                idle_timeout: config.idle_timeout,
                write_timeout: config.write_timeout,
            },
        };
        (Arc::new(handle), rx)
    }

    /// Process-unique serial. Two connections of the same caller never share one.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    #[must_use]
    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    #[must_use]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Enqueue a message. Returns `false` if the queue is full or closed.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        self.enqueue(Arc::new(msg))
    }

    /// Enqueue a shared message.
    pub fn enqueue(&self, msg: Arc<OutboundMessage>) -> bool {
        self.queue.try_send(msg)
    }

    /// Close the outbound queue. The write pump flushes what is queued, sends
    /// a close frame, and stops the read pump.
    ///
    /// Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let first = self.queue.close();
        if first {
            debug!(caller = %self.caller, serial = self.serial, "Connection closing");
        }
        first
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Topics this connection is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Resolves once both pumps are stopping.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn add_subscription(&self, topic: &str) {
        self.subscriptions.lock().insert(topic.to_string());
    }

    pub(crate) fn remove_subscription(&self, topic: &str) {
        self.subscriptions.lock().remove(topic);
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subscriptions.lock().clear();
    }

    /// Returns `true` the first time only.
    fn mark_unregistered(&self) -> bool {
        !self.unregistered.swap(true, Ordering::AcqRel)
    }
}

/// Drive one connection until it closes.
///
/// Registers the handle with the hub, runs the read pump on the current task
/// and the write pump on a spawned one, then unregisters exactly once.
pub async fn run_connection<R, W>(
    handle: Arc<ConnectionHandle>,
    outbound: mpsc::Receiver<Arc<OutboundMessage>>,
    mut reader: R,
    writer: W,
    hub: HubHandle,
    dispatcher: Arc<Dispatcher>,
) where
    R: FrameReader,
    W: FrameWriter + 'static,
{
    let peer = handle.caller().to_string();
    let keepalive = handle.keepalive;
    let writer_task = tokio::spawn(write_pump(
        outbound,
        writer,
        |msg: &Arc<OutboundMessage>| codec::encode_outbound(msg),
        keepalive,
        handle.cancel.clone(),
        peer.clone(),
    ));

    if let Err(e) = hub.register(handle.clone()) {
        warn!(caller = %peer, error = %e, "Hub refused connection");
        handle.close();
        let _ = writer_task.await;
        return;
    }
    info!(caller = %peer, serial = handle.serial(), "Connection opened");

    let ctx = HandlerContext::new(hub.clone(), handle.clone());
    while let Some(frame) = next_frame(&mut reader, keepalive.idle_timeout, &handle.cancel, &peer).await {
        handle.touch();
        match frame {
            WireFrame::Text(text) => match codec::decode_inbound(&text) {
                Ok(msg) => dispatcher.dispatch(&ctx, msg).await,
                Err(e) => {
                    debug!(caller = %peer, error = %e, "Undecodable frame");
                    ctx.reply_error(ErrorCode::InvalidMessage, e.to_string());
                }
            },
            WireFrame::Binary(_) => {
                ctx.reply_error(ErrorCode::InvalidMessage, "Binary frames are not supported");
            }
            WireFrame::Ping(_) | WireFrame::Pong(_) => {}
            WireFrame::Close => break,
        }
        if handle.is_closed() {
            break;
        }
    }

    handle.close();
    if handle.mark_unregistered() {
        let _ = hub.unregister(handle.clone());
    }
    let _ = writer_task.await;
    info!(caller = %peer, serial = handle.serial(), "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::PingHandler;
    use crate::hub::{Hub, HubConfig};
    use courier_protocol::kinds;
    use courier_transport::memory::{duplex, MemoryEndpoint};
    use courier_transport::TransportError;

    async fn recv_message(client: &mut MemoryEndpoint) -> OutboundMessage {
        loop {
            match client.reader.recv().await.unwrap() {
                Some(WireFrame::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        }
    }

    async fn send_text(client: &mut MemoryEndpoint, text: &str) {
        client.writer.send(WireFrame::Text(text.into())).await.unwrap();
    }

    fn spawn_connection(
        hub: &HubHandle,
        caller: &str,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, MemoryEndpoint, tokio::task::JoinHandle<()>) {
        let (client, server) = duplex();
        let (handle, rx) = ConnectionHandle::new(caller, config);
        let dispatcher = Arc::new(Dispatcher::new().with_handler(kinds::PING, PingHandler));
        let task = tokio::spawn(run_connection(
            handle.clone(),
            rx,
            server.reader,
            server.writer,
            hub.clone(),
            dispatcher,
        ));
        (handle, client, task)
    }

    #[test]
    fn test_serials_are_unique() {
        let config = ConnectionConfig::default();
        let (a, _) = ConnectionHandle::new("u1", &config);
        let (b, _) = ConnectionHandle::new("u1", &config);
        assert_ne!(a.serial(), b.serial());
        assert_eq!(a.caller(), b.caller());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, _rx) = ConnectionHandle::new("u1", &ConnectionConfig::default());
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(!conn.send(OutboundMessage::pong()));
    }

    #[tokio::test]
    async fn test_connected_ack_and_ping() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (_handle, mut client, _task) = spawn_connection(&hub, "u1", &ConnectionConfig::default());

        let ack = recv_message(&mut client).await;
        assert_eq!(ack.kind, kinds::CONNECTED);
        assert_eq!(ack.data.unwrap()["user_id"], "u1");

        send_text(&mut client, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_message(&mut client).await.kind, kinds::PONG);
        assert!(hub.is_online(&CallerId::from("u1")));
    }

    #[tokio::test]
    async fn test_bad_frames_keep_connection_open() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (handle, mut client, _task) = spawn_connection(&hub, "u1", &ConnectionConfig::default());
        recv_message(&mut client).await;

        send_text(&mut client, "{not json").await;
        assert_eq!(
            recv_message(&mut client).await.error_code(),
            Some(ErrorCode::InvalidMessage)
        );

        send_text(&mut client, r#"{"type":"teleport"}"#).await;
        assert_eq!(
            recv_message(&mut client).await.error_code(),
            Some(ErrorCode::UnknownMessageType)
        );

        client.writer.send(WireFrame::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(
            recv_message(&mut client).await.error_code(),
            Some(ErrorCode::InvalidMessage)
        );

        send_text(&mut client, r#"{"type":"ping"}"#).await;
        assert_eq!(recv_message(&mut client).await.kind, kinds::PONG);
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let (handle, mut client, task) = spawn_connection(&hub, "u1", &ConnectionConfig::default());
        recv_message(&mut client).await;

        client.writer.close().await.unwrap();
        task.await.unwrap();
        hub.sync().await.unwrap();

        assert!(handle.is_closed());
        assert!(!hub.is_online(&CallerId::from("u1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_closes_connection() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let config = ConnectionConfig {
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(3600),
            ..ConnectionConfig::default()
        };
        let (handle, mut client, task) = spawn_connection(&hub, "u1", &config);
        recv_message(&mut client).await;

        let start = Instant::now();
        task.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(handle.is_closed());

        // Close frame after the queue drained
        assert_eq!(client.reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eviction_closes_old_stream() {
        let (hub, _task) = Hub::spawn(HubConfig::default());
        let config = ConnectionConfig::default();
        let (old, mut old_client, old_task) = spawn_connection(&hub, "u1", &config);
        recv_message(&mut old_client).await;

        let (new, mut new_client, _new_task) = spawn_connection(&hub, "u1", &config);
        assert_eq!(recv_message(&mut new_client).await.kind, kinds::CONNECTED);

        old_task.await.unwrap();
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(matches!(
            old_client.reader.recv().await,
            Ok(None) | Err(TransportError::ConnectionClosed)
        ));

        // The old connection's unregister must not remove its successor
        hub.sync().await.unwrap();
        assert!(hub.is_online(&CallerId::from("u1")));
        assert_eq!(hub.connection_count(), 1);
    }
}
