//! The hub: single authority over live connections and topic subscriptions.
//!
//! All mutations go through one ordered command queue consumed by a single
//! processor task. The shared state sits behind an `RwLock` so handlers can
//! answer membership questions without a round trip; the lock guards reads
//! only, since the processor is the only task that ever takes it for writing.

use crate::connection::{CallerId, ConnectionHandle};
use crate::presence::{PresenceBook, PresenceRecord};
use crate::topic::validate_topic_name;
use courier_protocol::OutboundMessage;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Hub errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// The caller has no live connection.
    #[error("Caller not connected: {0}")]
    NotConnected(CallerId),

    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// The hub has shut down.
    #[error("Hub is shut down")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How often to look for stale connections.
    pub sweep_interval: Duration,
    /// Connections idle for longer than this are removed by the sweep.
    pub stale_after: Duration,
    /// Whether online/offline transitions are announced.
    pub presence_enabled: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5 * 60),
            stale_after: Duration::from_secs(2 * 60),
            presence_enabled: true,
        }
    }
}

/// Who receives a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single caller. Dropped silently when offline.
    Caller(CallerId),
    /// Every subscriber of a topic, optionally minus one caller.
    Topic {
        topic: String,
        exclude: Option<CallerId>,
    },
    /// Every live connection.
    All,
}

/// A message and its recipients.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub target: Target,
    pub message: Arc<OutboundMessage>,
}

impl BroadcastMessage {
    #[must_use]
    pub fn to_caller(caller: CallerId, message: impl Into<Arc<OutboundMessage>>) -> Self {
        Self {
            target: Target::Caller(caller),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn to_topic(topic: impl Into<String>, message: impl Into<Arc<OutboundMessage>>) -> Self {
        Self {
            target: Target::Topic {
                topic: topic.into(),
                exclude: None,
            },
            message: message.into(),
        }
    }

    #[must_use]
    pub fn to_topic_except(
        topic: impl Into<String>,
        exclude: CallerId,
        message: impl Into<Arc<OutboundMessage>>,
    ) -> Self {
        Self {
            target: Target::Topic {
                topic: topic.into(),
                exclude: Some(exclude),
            },
            message: message.into(),
        }
    }

    #[must_use]
    pub fn to_all(message: impl Into<Arc<OutboundMessage>>) -> Self {
        Self {
            target: Target::All,
            message: message.into(),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of topics with at least one subscriber.
    pub topic_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

enum HubCommand {
    Register(Arc<ConnectionHandle>),
    Unregister(Arc<ConnectionHandle>),
    Subscribe {
        caller: CallerId,
        topic: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unsubscribe {
        caller: CallerId,
        topic: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Broadcast(BroadcastMessage),
    Sync(oneshot::Sender<()>),
}

struct HubState {
    connections: HashMap<CallerId, Arc<ConnectionHandle>>,
    topics: HashMap<String, HashSet<CallerId>>,
    presence: PresenceBook,
}

impl HubState {
    /// Remove a caller from every topic, dropping topics left empty.
    fn strip_caller(&mut self, caller: &CallerId) {
        self.topics.retain(|_, subscribers| {
            subscribers.remove(caller);
            !subscribers.is_empty()
        });
    }

    fn others(&self, caller: &CallerId) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .filter(|(id, _)| *id != caller)
            .map(|(_, conn)| conn.clone())
            .collect()
    }
}

/// Cloneable handle used to talk to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
    state: Arc<RwLock<HubState>>,
    shutdown: CancellationToken,
}

impl HubHandle {
    fn submit(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.commands.send(cmd).map_err(|_| HubError::Closed)
    }

    /// Queue a connection for registration. An existing connection for the
    /// same caller is evicted and closed.
    pub fn register(&self, conn: Arc<ConnectionHandle>) -> Result<(), HubError> {
        self.submit(HubCommand::Register(conn))
    }

    /// Queue a connection for removal. A no-op unless the hub still holds
    /// this exact connection.
    pub fn unregister(&self, conn: Arc<ConnectionHandle>) -> Result<(), HubError> {
        self.submit(HubCommand::Unregister(conn))
    }

    /// Subscribe a live caller to a topic.
    pub async fn subscribe(&self, caller: &CallerId, topic: &str) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Subscribe {
            caller: caller.clone(),
            topic: topic.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Unsubscribe a live caller from a topic.
    pub async fn unsubscribe(&self, caller: &CallerId, topic: &str) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Unsubscribe {
            caller: caller.clone(),
            topic: topic.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Queue a broadcast.
    pub fn broadcast(&self, msg: BroadcastMessage) -> Result<(), HubError> {
        self.submit(HubCommand::Broadcast(msg))
    }

    /// Send to one caller.
    pub fn send_to(&self, caller: CallerId, msg: impl Into<Arc<OutboundMessage>>) -> Result<(), HubError> {
        self.broadcast(BroadcastMessage::to_caller(caller, msg))
    }

    /// Wait until every command submitted before this call has been applied.
    pub async fn sync(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::Sync(tx))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Stop the hub. Already queued commands are applied, then every
    /// connection is closed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    #[must_use]
    pub fn is_online(&self, caller: &CallerId) -> bool {
        self.state.read().connections.contains_key(caller)
    }

    #[must_use]
    pub fn connection(&self, caller: &CallerId) -> Option<Arc<ConnectionHandle>> {
        self.state.read().connections.get(caller).cloned()
    }

    #[must_use]
    pub fn connected_callers(&self) -> Vec<CallerId> {
        let mut callers: Vec<CallerId> = self.state.read().connections.keys().cloned().collect();
        callers.sort();
        callers
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.read().topics.contains_key(topic)
    }

    #[must_use]
    pub fn topic_subscribers(&self, topic: &str) -> Vec<CallerId> {
        let mut callers: Vec<CallerId> = self
            .state
            .read()
            .topics
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default();
        callers.sort();
        callers
    }

    #[must_use]
    pub fn is_subscribed(&self, caller: &CallerId, topic: &str) -> bool {
        self.state
            .read()
            .topics
            .get(topic)
            .is_some_and(|subs| subs.contains(caller))
    }

    #[must_use]
    pub fn presence(&self, caller: &CallerId) -> PresenceRecord {
        let state = self.state.read();
        state
            .presence
            .record(caller, state.connections.contains_key(caller))
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.state.read();
        HubStats {
            connection_count: state.connections.len(),
            topic_count: state.topics.len(),
            total_subscriptions: state.topics.values().map(HashSet::len).sum(),
        }
    }
}

/// The hub processor.
pub struct Hub {
    config: HubConfig,
    state: Arc<RwLock<HubState>>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Start a hub on the current runtime.
    #[must_use]
    pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
        Self::spawn_with_shutdown(config, CancellationToken::new())
    }

    /// Start a hub that also stops when `shutdown` is cancelled.
    #[must_use]
    pub fn spawn_with_shutdown(
        config: HubConfig,
        shutdown: CancellationToken,
    ) -> (HubHandle, JoinHandle<()>) {
        info!("Creating hub with config: {:?}", config);

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(HubState {
            connections: HashMap::new(),
            topics: HashMap::new(),
            presence: PresenceBook::new(config.presence_enabled),
        }));

        let handle = HubHandle {
            commands: tx,
            state: state.clone(),
            shutdown: shutdown.clone(),
        };
        let hub = Hub {
            config,
            state,
            commands: rx,
            shutdown,
        };
        (handle, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        let period = self.config.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = sweep.tick() => self.sweep_stale(),
            }
        }

        // Apply what was already queued, then refuse the rest.
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            self.apply(cmd);
        }
        self.close_all();
        info!("Hub stopped");
    }

    fn apply(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(conn) => self.register(conn),
            HubCommand::Unregister(conn) => self.unregister(&conn),
            HubCommand::Subscribe {
                caller,
                topic,
                reply,
            } => {
                let _ = reply.send(self.subscribe(&caller, &topic));
            }
            HubCommand::Unsubscribe {
                caller,
                topic,
                reply,
            } => {
                let _ = reply.send(self.unsubscribe(&caller, &topic));
            }
            HubCommand::Broadcast(msg) => self.broadcast(msg),
            HubCommand::Sync(done) => {
                let _ = done.send(());
            }
        }
    }

    fn register(&mut self, conn: Arc<ConnectionHandle>) {
        let caller = conn.caller().clone();

        if conn.is_closed() {
            debug!(caller = %caller, "Ignoring registration of a closed connection");
            return;
        }

        let (replaced, announcement) = {
            let mut state = self.state.write();
            let replaced = state.connections.insert(caller.clone(), conn.clone());
            if replaced.is_some() {
                state.strip_caller(&caller);
            }
            let announcement = match replaced {
                Some(_) => None,
                None => state.presence.transition(&caller, true),
            };
            (replaced, announcement)
        };

        if let Some(old) = replaced {
            info!(caller = %caller, old = old.serial(), new = conn.serial(), "Connection replaced");
            old.clear_subscriptions();
            old.close();
        } else {
            debug!(caller = %caller, serial = conn.serial(), "Connection registered");
        }

        let mut failed = Vec::new();
        if !conn.send(OutboundMessage::connected(caller.as_str())) {
            failed.push(conn);
        }
        if let Some(update) = announcement {
            let recipients = self.state.read().others(&caller);
            failed.extend(deliver(recipients, &Arc::new(update)));
        }
        self.drop_failed(failed);
    }

    fn unregister(&mut self, conn: &Arc<ConnectionHandle>) {
        if let Some(Some(update)) = self.remove(conn) {
            let recipients = self.state.read().others(conn.caller());
            let failed = deliver(recipients, &Arc::new(update));
            self.drop_failed(failed);
        }
    }

    /// Remove `conn` if it is still the live connection for its caller.
    ///
    /// Returns `None` when it was not, otherwise the presence announcement to
    /// fan out (itself `None` when presence is disabled).
    fn remove(&mut self, conn: &Arc<ConnectionHandle>) -> Option<Option<OutboundMessage>> {
        let caller = conn.caller();
        let announcement = {
            let mut state = self.state.write();
            match state.connections.get(caller) {
                Some(current) if current.serial() == conn.serial() => {}
                _ => {
                    trace!(caller = %caller, serial = conn.serial(), "Unregister of a stale connection ignored");
                    return None;
                }
            }
            state.connections.remove(caller);
            state.strip_caller(caller);
            state.presence.transition(caller, false)
        };

        conn.clear_subscriptions();
        conn.close();
        debug!(caller = %caller, serial = conn.serial(), "Connection unregistered");
        Some(announcement)
    }

    /// Remove connections whose queue rejected a message.
    ///
    /// Each removal announces the caller offline, which may fill more queues,
    /// so this works through a list instead of recursing.
    fn drop_failed(&mut self, mut failed: Vec<Arc<ConnectionHandle>>) {
        while let Some(conn) = failed.pop() {
            warn!(caller = %conn.caller(), serial = conn.serial(), "Outbound queue full, dropping connection");
            if let Some(Some(update)) = self.remove(&conn) {
                let recipients = self.state.read().others(conn.caller());
                failed.extend(deliver(recipients, &Arc::new(update)));
            }
        }
    }

    fn subscribe(&mut self, caller: &CallerId, topic: &str) -> Result<(), HubError> {
        validate_topic_name(topic).map_err(HubError::InvalidTopic)?;

        let mut state = self.state.write();
        let conn = state
            .connections
            .get(caller)
            .cloned()
            .ok_or_else(|| HubError::NotConnected(caller.clone()))?;

        let subscribers = state.topics.entry(topic.to_string()).or_insert_with(|| {
            debug!(topic = %topic, "Creating topic");
            HashSet::new()
        });
        subscribers.insert(caller.clone());
        conn.add_subscription(topic);

        debug!(
            topic = %topic,
            caller = %caller,
            subscribers = subscribers.len(),
            "Subscribed"
        );
        Ok(())
    }

    fn unsubscribe(&mut self, caller: &CallerId, topic: &str) -> Result<(), HubError> {
        let mut state = self.state.write();
        let conn = state
            .connections
            .get(caller)
            .cloned()
            .ok_or_else(|| HubError::NotConnected(caller.clone()))?;

        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.remove(caller);
            if subscribers.is_empty() {
                state.topics.remove(topic);
                debug!(topic = %topic, "Deleted empty topic");
            }
        }
        conn.remove_subscription(topic);

        debug!(topic = %topic, caller = %caller, "Unsubscribed");
        Ok(())
    }

    fn broadcast(&mut self, msg: BroadcastMessage) {
        let recipients: Vec<Arc<ConnectionHandle>> = {
            let state = self.state.read();
            match &msg.target {
                Target::Caller(caller) => state.connections.get(caller).cloned().into_iter().collect(),
                Target::Topic { topic, exclude } => state
                    .topics
                    .get(topic)
                    .map(|subscribers| {
                        subscribers
                            .iter()
                            .filter(|caller| Some(*caller) != exclude.as_ref())
                            .filter_map(|caller| state.connections.get(caller).cloned())
                            .collect()
                    })
                    .unwrap_or_default(),
                Target::All => state.connections.values().cloned().collect(),
            }
        };

        trace!(
            to = ?msg.target,
            kind = %msg.message.kind,
            recipients = recipients.len(),
            "Broadcast"
        );

        let failed = deliver(recipients, &msg.message);
        self.drop_failed(failed);
    }

    fn sweep_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<Arc<ConnectionHandle>> = self
            .state
            .read()
            .connections
            .values()
            .filter(|conn| now.saturating_duration_since(conn.last_activity()) > self.config.stale_after)
            .cloned()
            .collect();

        if stale.is_empty() {
            return;
        }
        info!(count = stale.len(), "Removing stale connections");
        for conn in stale {
            self.unregister(&conn);
        }
    }

    fn close_all(&mut self) {
        let mut state = self.state.write();
        for conn in state.connections.values() {
            conn.clear_subscriptions();
            conn.close();
        }
        info!(connections = state.connections.len(), "Closing all connections");
        state.connections.clear();
        state.topics.clear();
    }
}

/// Enqueue on every recipient, returning those whose queue rejected it.
fn deliver(
    recipients: Vec<Arc<ConnectionHandle>>,
    msg: &Arc<OutboundMessage>,
) -> Vec<Arc<ConnectionHandle>> {
    recipients
        .into_iter()
        .filter(|conn| !conn.enqueue(msg.clone()))
        .collect()
}
