//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use courier_core::{HubHandle, RelayClient, RelayPeers, RelayState};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const HUB_CONNECTIONS: &str = "courier_hub_connections";
    pub const TOPICS_ACTIVE: &str = "courier_topics_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "courier_subscriptions_active";
    pub const RELAY_CONNECTED: &str = "courier_relay_connected";
    pub const RELAY_SESSIONS: &str = "courier_relay_sessions";
    pub const REJECTED_TOTAL: &str = "courier_upgrades_rejected_total";
}

/// Interval between hub gauge refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket streams"
    );
    metrics::describe_gauge!(names::HUB_CONNECTIONS, "Connections registered with the hub");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topics");
    metrics::describe_gauge!(names::SUBSCRIPTIONS_ACTIVE, "Current number of topic subscriptions");
    metrics::describe_gauge!(names::RELAY_CONNECTED, "1 while the relay link is up");
    metrics::describe_gauge!(names::RELAY_SESSIONS, "Accepted relay sessions");
    metrics::describe_counter!(names::REJECTED_TOTAL, "Upgrade requests rejected");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a rejected upgrade.
pub fn record_rejected(reason: &'static str) {
    counter!(names::REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Periodically copy hub and relay state into gauges until `shutdown`.
pub async fn refresh_gauges(
    hub: HubHandle,
    relay: Option<RelayClient>,
    peers: Option<RelayPeers>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stats = hub.stats();
        gauge!(names::HUB_CONNECTIONS).set(stats.connection_count as f64);
        gauge!(names::TOPICS_ACTIVE).set(stats.topic_count as f64);
        gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
        if let Some(relay) = &relay {
            let up = relay.state() == RelayState::Connected;
            gauge!(names::RELAY_CONNECTED).set(if up { 1.0 } else { 0.0 });
        }
        if let Some(peers) = &peers {
            gauge!(names::RELAY_SESSIONS).set(peers.len() as f64);
        }
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
