//! Server configuration.
//!
//! Configuration is loaded from the first TOML file found among:
//! - the path in `COURIER_CONFIG`
//! - `courier.toml`
//! - `/etc/courier/courier.toml`
//! - `~/.config/courier/courier.toml`
//!
//! `COURIER_HOST` and `COURIER_PORT` override the bind address either way.

use anyhow::{Context, Result};
use courier_core::{ConnectionConfig, HubConfig, RateLimitConfig, RelayConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Which side of the relay link this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Client-facing hub; dials the peer when `relay.url` is set.
    Gateway,
    /// Hub inside the chat service; accepts relay sessions on `/relay`.
    Peer,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_role")]
    pub role: Role,

    /// Origins accepted on `/ws`. `"*"` accepts any origin that is present.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub relay: RelaySettings,

    #[serde(default)]
    pub auth: AuthSettings,

    /// Conversations known to the built-in backend.
    #[serde(default)]
    pub conversations: Vec<ConversationSettings>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Per-connection limits and keep-alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Idle read deadline in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Ping interval in milliseconds.
    #[serde(default = "default_client_ping")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Rate-limited messages admitted per window.
    #[serde(default = "default_rate_capacity")]
    pub rate_limit: usize,

    #[serde(default = "default_rate_window")]
    pub rate_window_ms: u64,
}

/// Hub housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Connections idle longer than this are swept.
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,

    #[serde(default = "default_true")]
    pub presence: bool,
}

/// Relay link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Peer relay endpoint, e.g. `ws://chat:8081/relay`. Gateway only.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_relay_ping")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Caller authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Accept the caller id from the `X-User-ID` header of a trusted proxy.
    #[serde(default)]
    pub trust_forwarded_user: bool,

    /// Static bearer tokens, token to caller id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// A conversation and its members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSettings {
    pub id: u64,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_role() -> Role {
    Role::Gateway
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_client_ping() -> u64 {
    54_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_rate_capacity() -> usize {
    10
}

fn default_rate_window() -> u64 {
    60_000
}

fn default_sweep_interval() -> u64 {
    5 * 60_000
}

fn default_stale_after() -> u64 {
    2 * 60_000
}

fn default_retry_delay() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    5_000
}

fn default_relay_ping() -> u64 {
    30_000
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            role: default_role(),
            allowed_origins: default_allowed_origins(),
            connection: ConnectionSettings::default(),
            hub: HubSettings::default(),
            relay: RelaySettings::default(),
            auth: AuthSettings::default(),
            conversations: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            idle_timeout_ms: default_idle_timeout(),
            ping_interval_ms: default_client_ping(),
            write_timeout_ms: default_write_timeout(),
            rate_limit: default_rate_capacity(),
            rate_window_ms: default_rate_window(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval(),
            stale_after_ms: default_stale_after(),
            presence: true,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            url: None,
            retry_delay_ms: default_retry_delay(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout(),
            ping_interval_ms: default_relay_ping(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl ConnectionSettings {
    #[must_use]
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            outbound_capacity: self.outbound_capacity,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            rate_limit: RateLimitConfig {
                capacity: self.rate_limit,
                window: Duration::from_millis(self.rate_window_ms),
            },
        }
    }
}

impl HubSettings {
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            stale_after: Duration::from_millis(self.stale_after_ms),
            presence_enabled: self.presence,
        }
    }
}

impl RelaySettings {
    /// Relay configuration; the write deadline is shared with client connections.
    #[must_use]
    pub fn to_relay_config(&self, connection: &ConnectionSettings) -> RelayConfig {
        RelayConfig {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retries: self.max_retries,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            idle_timeout: Duration::from_millis(connection.idle_timeout_ms),
            write_timeout: Duration::from_millis(connection.write_timeout_ms),
            ..RelayConfig::default()
        }
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// `COURIER_CONFIG` names a file that cannot be read.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("COURIER_CONFIG") {
            Ok(path) => Self::from_file(shellexpand::tilde(&path).as_ref())?,
            Err(_) => Self::search()?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn search() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("COURIER_HOST") {
            self.host = host;
        }
        if let Some(port) = var("COURIER_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid COURIER_PORT: {port}"))?;
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.role, Role::Gateway);
        assert!(config.relay.url.is_none());

        let connection = config.connection.to_connection_config();
        assert_eq!(connection.outbound_capacity, 256);
        assert_eq!(connection.idle_timeout, Duration::from_secs(60));
        assert_eq!(connection.ping_interval, Duration::from_secs(54));
        assert_eq!(connection.rate_limit.capacity, 10);
        assert_eq!(connection.rate_limit.window, Duration::from_secs(60));

        let hub = config.hub.to_hub_config();
        assert_eq!(hub.sweep_interval, Duration::from_secs(300));
        assert_eq!(hub.stale_after, Duration::from_secs(120));

        let relay = config.relay.to_relay_config(&config.connection);
        assert_eq!(relay.retry_delay, Duration::from_secs(5));
        assert_eq!(relay.max_retries, 10);
        assert_eq!(relay.request_timeout, Duration::from_secs(5));
        assert_eq!(relay.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let config = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            role = "peer"
            allowed_origins = ["https://app.example.com"]

            [connection]
            rate_limit = 5

            [relay]
            url = "ws://chat:8081/relay"
            max_retries = 2

            [auth.tokens]
            secret = "u1"

            [[conversations]]
            id = 42
            members = ["u1", "u2"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.role, Role::Peer);
        assert_eq!(config.allowed_origins, vec!["https://app.example.com"]);
        assert_eq!(config.connection.rate_limit, 5);
        assert_eq!(config.connection.rate_window_ms, 60_000);
        assert_eq!(config.relay.url.as_deref(), Some("ws://chat:8081/relay"));
        assert_eq!(config.relay.max_retries, 2);
        assert_eq!(config.auth.tokens.get("secret").map(String::as_str), Some("u1"));
        assert_eq!(config.conversations[0].members, vec!["u1", "u2"]);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(|key| match key {
                "COURIER_HOST" => Some("0.0.0.0".into()),
                "COURIER_PORT" => Some("9999".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9999);

        let err = config.apply_env(|key| (key == "COURIER_PORT").then(|| "http".into()));
        assert!(err.is_err());
    }
}
