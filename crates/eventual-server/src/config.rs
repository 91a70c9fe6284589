//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (`EVENTUAL_*`, `JWT_TOKEN_SECRET`, `LOG_LEVEL`, ...)
//! - TOML configuration file
//! - A config path given as the first command line argument

use anyhow::{Context, Result};
use eventual_core::{FederationConfig, PoolConfig, ReplayConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for WebSocket clients and the HTTP endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub pool: PoolSection,

    #[serde(default)]
    pub replay: ReplaySection,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Peer federation.
    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Log the duration of hot paths.
    #[serde(default = "default_profiling")]
    pub profiling: bool,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Capacity of each session's outbound queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_queue_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Idle read deadline in milliseconds, reset by every frame or pong.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Ping period in milliseconds. Defaults to 90% of `pong_wait_ms`.
    #[serde(default)]
    pub ping_period_ms: Option<u64>,

    /// Deadline for a single write in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of each of the four request channels.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_cleaner_interval")]
    pub cleaner_interval_secs: u64,

    #[serde(default = "default_history_send_timeout")]
    pub history_send_timeout_ms: u64,
}

/// Replay queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySection {
    /// Sliding lifetime of a channel's buffer.
    #[serde(default = "default_replay_ttl")]
    pub ttl_secs: u64,

    /// Hard cap on the age of a buffered event.
    #[serde(default = "default_replay_max_age")]
    pub max_age_secs: u64,

    #[serde(default = "default_replay_purge_interval")]
    pub purge_interval_secs: u64,
}

/// Token configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 secret.
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Lifetime of tokens this broker signs for peer calls.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

/// Peer federation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Port for the peer RPC listener.
    #[serde(default = "default_rpc_port")]
    pub port: u16,

    /// Address peers should use to reach this broker. Defaults to `host:port`.
    #[serde(default = "default_advertise")]
    pub advertise: Option<String>,

    /// Timeout of a single outbound call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Maximum concurrent outbound deliveries.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Federation batch tick.
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    /// Brokers to subscribe to at startup.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Attempts per upstream subscription.
    #[serde(default = "default_subscribe_attempts")]
    pub subscribe_attempts: u32,

    #[serde(default = "default_subscribe_retry")]
    pub subscribe_retry_ms: u64,
}

/// A broker whose events this broker wants pushed to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub address: String,
    pub channels: Vec<String>,
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

/// Logging configuration. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
}

// Default value functions
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_port(name: &str, fallback: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(fallback)
}

fn default_host() -> String {
    std::env::var("EVENTUAL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    env_port("EVENTUAL_PORT", 8080)
}

fn default_true() -> bool {
    true
}

fn default_profiling() -> bool {
    env_flag("PROFILING")
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_capacity() -> usize {
    eventual_core::session::DEFAULT_OUTBOUND_CAPACITY
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_write_wait() -> u64 {
    30_000 // 30 seconds
}

fn default_workers() -> usize {
    32
}

fn default_queue_capacity() -> usize {
    4
}

fn default_cleaner_interval() -> u64 {
    120
}

fn default_history_send_timeout() -> u64 {
    5_000
}

fn default_replay_ttl() -> u64 {
    5 * 60
}

fn default_replay_max_age() -> u64 {
    10 * 60
}

fn default_replay_purge_interval() -> u64 {
    10 * 60
}

fn default_secret() -> String {
    std::env::var("JWT_TOKEN_SECRET").unwrap_or_default()
}

fn default_token_ttl() -> u64 {
    60 * 60
}

fn default_rpc_port() -> u16 {
    env_port("EVENTUAL_RPC_PORT", 9090)
}

fn default_advertise() -> Option<String> {
    std::env::var("EVENTUAL_RPC_ADVERTISE")
        .ok()
        .filter(|s| !s.is_empty())
}

fn default_call_timeout() -> u64 {
    30_000
}

fn default_max_concurrent() -> usize {
    64
}

fn default_batch_interval() -> u64 {
    1
}

fn default_subscribe_attempts() -> u32 {
    5
}

fn default_subscribe_retry() -> u64 {
    2_000
}

fn default_metrics_port() -> u16 {
    env_port("EVENTUAL_METRICS_PORT", 9464)
}

fn default_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

fn default_timestamps() -> bool {
    !env_flag("DISABLE_LOG_TIMESTAMPS")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            pool: PoolSection::default(),
            replay: ReplaySection::default(),
            auth: AuthConfig::default(),
            rpc: RpcConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            profiling: default_profiling(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: None,
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            cleaner_interval_secs: default_cleaner_interval(),
            history_send_timeout_ms: default_history_send_timeout(),
        }
    }
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            ttl_secs: default_replay_ttl(),
            max_age_secs: default_replay_max_age(),
            purge_interval_secs: default_replay_purge_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: default_rpc_port(),
            advertise: default_advertise(),
            call_timeout_ms: default_call_timeout(),
            max_concurrent: default_max_concurrent(),
            batch_interval_ms: default_batch_interval(),
            upstreams: Vec::new(),
            subscribe_attempts: default_subscribe_attempts(),
            subscribe_retry_ms: default_subscribe_retry(),
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

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_timestamps(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Ping period, 90% of the pong wait unless set explicitly.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        let ms = self
            .ping_period_ms
            .unwrap_or(self.pong_wait_ms * 9 / 10)
            .max(1);
        Duration::from_millis(ms)
    }

    #[must_use]
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }
}

impl RpcConfig {
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "eventual.toml",
            "/etc/eventual/eventual.toml",
            "~/.config/eventual/eventual.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
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

    /// Get the socket address for WebSocket and HTTP clients.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get the socket address for the peer RPC listener.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` is not an IP address.
    pub fn rpc_bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.rpc.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.rpc.port))
    }

    /// Address this broker gives peers when subscribing to them.
    #[must_use]
    pub fn advertise_address(&self) -> String {
        self.rpc
            .advertise
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.rpc.port))
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.pool.workers,
            queue_capacity: self.pool.queue_capacity,
            cleaner_interval: Duration::from_secs(self.pool.cleaner_interval_secs),
            history_send_timeout: Duration::from_millis(self.pool.history_send_timeout_ms),
            profiling: self.profiling,
        }
    }

    #[must_use]
    pub fn replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            ttl: Duration::from_secs(self.replay.ttl_secs),
            max_age: Duration::from_secs(self.replay.max_age_secs),
            purge_interval: Duration::from_secs(self.replay.purge_interval_secs),
        }
    }

    #[must_use]
    pub fn federation_config(&self) -> FederationConfig {
        FederationConfig {
            batch_interval: Duration::from_millis(self.rpc.batch_interval_ms.max(1)),
            ..FederationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sections() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.limits.outbound_queue_capacity, 32);
        assert_eq!(config.pool.workers, 32);
        assert_eq!(config.pool.queue_capacity, 4);
        assert_eq!(config.pool.cleaner_interval_secs, 120);
        assert_eq!(config.rpc.call_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_heartbeat_derivation() {
        let heartbeat = HeartbeatConfig::default();
        assert_eq!(heartbeat.pong_wait(), Duration::from_secs(60));
        assert_eq!(heartbeat.ping_period(), Duration::from_secs(54));
        assert_eq!(heartbeat.write_wait(), Duration::from_secs(30));

        let explicit = HeartbeatConfig {
            ping_period_ms: Some(500),
            ..HeartbeatConfig::default()
        };
        assert_eq!(explicit.ping_period(), Duration::from_millis(500));
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_advertise_address_falls_back_to_rpc_bind() {
        let mut config = Config {
            host: "10.1.2.3".into(),
            ..Config::default()
        };
        config.rpc.port = 9191;
        config.rpc.advertise = None;
        assert_eq!(config.advertise_address(), "10.1.2.3:9191");

        config.rpc.advertise = Some("broker-a.internal:9191".into());
        assert_eq!(config.advertise_address(), "broker-a.internal:9191");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            profiling = true

            [limits]
            max_message_size = 1024

            [replay]
            ttl_secs = 10

            [rpc]
            port = 9100

            [[rpc.upstreams]]
            address = "10.0.0.2:9090"
            channels = ["weather", "global"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.profiling);
        assert_eq!(config.limits.max_message_size, 1024);
        assert_eq!(config.replay_config().ttl, Duration::from_secs(10));
        assert_eq!(config.replay_config().max_age, Duration::from_secs(600));
        assert_eq!(config.rpc.port, 9100);
        assert_eq!(config.rpc.upstreams.len(), 1);
        assert_eq!(config.rpc.upstreams[0].channels, vec!["weather", "global"]);
        assert!(config.pool_config().profiling);
    }

    #[test]
    fn test_secret_is_redacted() {
        let auth = AuthConfig {
            secret: "hunter2".into(),
            token_ttl_secs: 60,
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }
}
