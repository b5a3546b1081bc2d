//! Reconnecting relay client.
//!
//! A supervisor task owns the link. It connects, runs one session until the
//! stream drops, then reconnects right away. Consecutive connect failures
//! are retried after a fixed delay; once `max_retries` retries have failed
//! the client gives up for good and every send fails fast with
//! [`RelayError::Unavailable`].

use crate::pump::{next_frame, write_pump, PumpConfig};
use async_trait::async_trait;
use courier_protocol::{codec, RelayEnvelope, RelayStatus};
use courier_transport::{BoxReader, BoxWriter, Connector, WireFrame};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Relay client errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// No session is currently established.
    #[error("Relay not connected")]
    NotConnected,

    /// Retries are exhausted; the client no longer reconnects.
    #[error("Relay unavailable")]
    Unavailable,

    /// No reply arrived before the request deadline.
    #[error("Relay request timed out")]
    Timeout,

    /// The peer answered with an error status.
    #[error("Relay peer error: {0}")]
    Remote(String),

    /// The session ended while waiting, or the client was stopped.
    #[error("Relay closed")]
    Closed,

    /// The session's send queue is full.
    #[error("Relay send queue full")]
    QueueFull,
}

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Connected,
    /// Circuit open after exhausting retries. Terminal.
    Unavailable,
    /// Stopped by [`RelayClient::stop`]. Terminal.
    Stopped,
}

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Delay between connect attempts.
    pub retry_delay: Duration,
    /// Failed retries tolerated before giving up.
    pub max_retries: u32,
    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
    /// Deadline for a reply to a request.
    pub request_timeout: Duration,
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// End the session after this long without any inbound frame.
    pub idle_timeout: Duration,
    /// Deadline for a single write.
    pub write_timeout: Duration,
    /// Send queue capacity.
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            max_retries: 10,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: 100,
        }
    }
}

/// Receives envelopes the peer sends without being asked.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn on_push(&self, envelope: RelayEnvelope);
}

/// Routes pushes to handlers by type.
#[derive(Default)]
pub struct PushRouter {
    handlers: HashMap<String, Arc<dyn PushHandler>>,
}

impl PushRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, kind: impl Into<String>, handler: Arc<dyn PushHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }
}

#[async_trait]
impl PushHandler for PushRouter {
    async fn on_push(&self, envelope: RelayEnvelope) {
        match self.handlers.get(&envelope.kind) {
            Some(handler) => handler.on_push(envelope).await,
            None => debug!(kind = %envelope.kind, "Ignoring relay push"),
        }
    }
}

struct Inner {
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    push: Arc<dyn PushHandler>,
    state: watch::Sender<RelayState>,
    /// Present exactly while a session is up.
    outbound: RwLock<Option<mpsc::Sender<RelayEnvelope>>>,
    pending: DashMap<String, oneshot::Sender<RelayEnvelope>>,
    shutdown: CancellationToken,
    attempts: AtomicU64,
}

/// Handle to the relay link. Cheap to clone.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl RelayClient {
    /// Start the supervisor on the current runtime.
    #[must_use]
    pub fn spawn(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        push: Arc<dyn PushHandler>,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn_with_shutdown(config, connector, push, CancellationToken::new())
    }

    /// Start a supervisor that also stops when `shutdown` is cancelled.
    #[must_use]
    pub fn spawn_with_shutdown(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        push: Arc<dyn PushHandler>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (state, _) = watch::channel(RelayState::Connecting);
        let client = Self {
            inner: Arc::new(Inner {
                config,
                connector,
                push,
                state,
                outbound: RwLock::new(None),
                pending: DashMap::new(),
                shutdown,
                attempts: AtomicU64::new(0),
            }),
        };
        let task = tokio::spawn(client.clone().supervise());
        (client, task)
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == RelayState::Connected
    }

    /// Requests waiting for a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Connect attempts made so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Queue an envelope on the current session without waiting.
    pub fn send(&self, envelope: RelayEnvelope) -> Result<(), RelayError> {
        match self.state() {
            RelayState::Unavailable => return Err(RelayError::Unavailable),
            RelayState::Stopped => return Err(RelayError::Closed),
            RelayState::Connecting | RelayState::Connected => {}
        }

        let outbound = self.inner.outbound.read();
        let tx = outbound.as_ref().ok_or(RelayError::NotConnected)?;
        tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::QueueFull,
            TrySendError::Closed(_) => RelayError::NotConnected,
        })
    }

    /// Send a request and wait for the reply carrying the same request id.
    ///
    /// A reply with an error status resolves to [`RelayError::Remote`]. A
    /// reply that arrives after the deadline is dropped.
    pub async fn request(&self, envelope: RelayEnvelope) -> Result<RelayEnvelope, RelayError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(request_id.clone(), tx);

        if let Err(e) = self.send(envelope.with_request_id(request_id.clone())) {
            self.inner.pending.remove(&request_id);
            return Err(e);
        }

        match timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(reply)) => match reply.status {
                Some(RelayStatus::Error) => Err(RelayError::Remote(
                    reply.error.unwrap_or_else(|| "unspecified error".to_string()),
                )),
                _ => Ok(reply),
            },
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.inner.pending.remove(&request_id);
                debug!(request_id = %request_id, "Relay request timed out");
                Err(RelayError::Timeout)
            }
        }
    }

    /// Stop the supervisor and close the current session.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    fn set_state(&self, state: RelayState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Relay state changed");
        }
    }

    async fn supervise(self) {
        let peer = self.inner.connector.target();
        let config = self.inner.config.clone();
        let mut failures: u32 = 0;

        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            self.set_state(RelayState::Connecting);
            self.inner.attempts.fetch_add(1, Ordering::Relaxed);

            let attempt = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                attempt = timeout(config.connect_timeout, self.inner.connector.connect()) => attempt,
            };

            let reason = match attempt {
                Ok(Ok((reader, writer))) => {
                    failures = 0;
                    self.run_session(reader, writer, &peer).await;
                    if self.inner.shutdown.is_cancelled() {
                        break;
                    }
                    warn!(peer = %peer, "Relay session ended, reconnecting");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "connect timed out".to_string(),
            };

            if failures >= config.max_retries {
                error!(
                    peer = %peer,
                    retries = failures,
                    error = %reason,
                    "Relay unavailable, giving up"
                );
                self.set_state(RelayState::Unavailable);
                return;
            }
            failures += 1;
            warn!(
                peer = %peer,
                attempt = failures,
                max_retries = config.max_retries,
                error = %reason,
                "Relay connect failed. Retry in {:.1}s",
                config.retry_delay.as_secs_f64()
            );

            tokio::select! {
                _ = tokio::time::sleep(config.retry_delay) => {}
                _ = self.inner.shutdown.cancelled() => break,
            }
        }

        self.set_state(RelayState::Stopped);
        info!(peer = %peer, "Relay client stopped");
    }

    async fn run_session(&self, mut reader: BoxReader, writer: BoxWriter, peer: &str) {
        let config = &self.inner.config;
        let pump = PumpConfig {
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
            write_timeout: config.write_timeout,
        };
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let done = self.inner.shutdown.child_token();
        let writer_task = tokio::spawn(write_pump(
            rx,
            writer,
            codec::encode_relay,
            pump,
            done.clone(),
            peer.to_string(),
        ));

        *self.inner.outbound.write() = Some(tx);
        self.set_state(RelayState::Connected);
        info!(peer = %peer, "Relay connected");

        while let Some(frame) = next_frame(&mut reader, pump.idle_timeout, &done, peer).await {
            match frame {
                WireFrame::Text(text) => match codec::decode_relay(&text) {
                    Ok(envelope) => self.route(envelope).await,
                    Err(e) => warn!(peer = %peer, error = %e, "Dropping undecodable relay frame"),
                },
                WireFrame::Close => break,
                WireFrame::Binary(_) | WireFrame::Ping(_) | WireFrame::Pong(_) => {}
            }
        }

        self.inner.outbound.write().take();
        let _ = writer_task.await;

        // Waiters of this session will never get their reply
        let orphaned = self.inner.pending.len();
        self.inner.pending.clear();
        if orphaned > 0 {
            debug!(peer = %peer, orphaned, "Failed pending relay requests");
        }
    }

    async fn route(&self, envelope: RelayEnvelope) {
        if envelope.is_reply() {
            let request_id = envelope.request_id.clone().unwrap_or_default();
            match self.inner.pending.remove(&request_id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(envelope);
                }
                None => debug!(request_id = %request_id, "Dropping unmatched relay reply"),
            }
            return;
        }

        if envelope.expects_reply() {
            warn!(kind = %envelope.kind, "Ignoring request from relay peer");
            return;
        }

        self.inner.push.on_push(envelope).await;
    }
}
