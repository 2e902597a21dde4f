//! Configuration Module
//!
//! Provides TOML-based configuration for JobPulse with support for:
//! - Server settings (bind address, WebSocket path)
//! - Connection and subscription limits
//! - Heartbeat timing
//! - Dispatch queue sizing
//! - Pub/sub transport selection
//! - Background task lifecycle timing
//! - Environment variable overrides (JOBPULSE__* prefix)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use metrics::MetricsConfig;
pub use pubsub::{PubSubBackend, PubSubConfig};

mod metrics;
mod pubsub;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Heartbeat configuration
    pub heartbeat: HeartbeatConfig,
    /// Dispatch queue configuration
    pub dispatch: DispatchConfig,
    /// Pub/sub transport configuration
    pub pubsub: PubSubConfig,
    /// Background task lifecycle configuration
    pub lifecycle: LifecycleConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// WebSocket path (default: "/ws")
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:8765".parse().unwrap()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_path: default_ws_path(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of concurrent client connections (0 = unbounded)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum channels a single connection may subscribe to (0 = unbounded)
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,
    /// Maximum length of a channel identifier in bytes
    #[serde(default = "default_max_channel_length")]
    pub max_channel_length: usize,
    /// Maximum size of a single inbound client message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_max_connections() -> usize {
    10_000
}
fn default_max_subscriptions() -> usize {
    256
}
fn default_max_channel_length() -> usize {
    256
}
fn default_max_message_size() -> usize {
    64 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_channel_length: default_max_channel_length(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Idle time without client activity before a ping is sent (e.g. "30s")
    #[serde(default = "default_idle_interval", with = "humantime_serde")]
    pub idle_interval: Duration,
    /// Time allowed for the pong after a ping (e.g. "10s")
    #[serde(default = "default_pong_timeout", with = "humantime_serde")]
    pub pong_timeout: Duration,
}

fn default_idle_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_pong_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            idle_interval: default_idle_interval(),
            pong_timeout: default_pong_timeout(),
        }
    }
}

/// Dispatch queue configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of the queue between the inbound bridge and the dispatcher
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum concurrent sends while fanning out one event
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    /// Per-subscriber send timeout (e.g. "5s")
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_max_concurrent_sends() -> usize {
    64
}
fn default_send_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_concurrent_sends: default_max_concurrent_sends(),
            send_timeout: default_send_timeout(),
        }
    }
}

/// Background task lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on waiting for background tasks during shutdown
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Initial delay before restarting a crashed background task
    #[serde(default = "default_restart_backoff", with = "humantime_serde")]
    pub restart_backoff: Duration,
    /// Maximum restart delay after repeated crashes
    #[serde(default = "default_max_restart_backoff", with = "humantime_serde")]
    pub max_restart_backoff: Duration,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_restart_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_max_restart_backoff() -> Duration {
    Duration::from_secs(30)
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
            restart_backoff: default_restart_backoff(),
            max_restart_backoff: default_max_restart_backoff(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `JOBPULSE__` prefix with double underscores for nesting:
    ///    - `JOBPULSE__SERVER__BIND=0.0.0.0:9000` overrides `server.bind`
    ///    - `JOBPULSE__PUBSUB__URL=redis://cache:6379/1` overrides `pubsub.url`
    ///    - `JOBPULSE__HEARTBEAT__IDLE_INTERVAL=15s` overrides `heartbeat.idle_interval`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:8765")?
            .set_default("server.ws_path", "/ws")?
            .set_default("limits.max_connections", 10_000)?
            .set_default("limits.max_subscriptions_per_connection", 256)?
            .set_default("limits.max_channel_length", 256)?
            .set_default("limits.max_message_size", 64 * 1024)?
            .set_default("heartbeat.idle_interval", "30s")?
            .set_default("heartbeat.pong_timeout", "10s")?
            .set_default("dispatch.queue_capacity", 1024)?
            .set_default("dispatch.max_concurrent_sends", 64)?
            .set_default("dispatch.send_timeout", "5s")?
            .set_default("pubsub.backend", "redis")?
            .set_default("pubsub.url", "redis://127.0.0.1:6379/0")?
            .set_default("pubsub.namespace", "websocket")?
            .set_default("pubsub.connect_timeout", "5s")?
            .set_default("lifecycle.shutdown_timeout", "5s")?
            .set_default("lifecycle.restart_backoff", "1s")?
            .set_default("lifecycle.max_restart_backoff", "30s")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("JOBPULSE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.ws_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "server.ws_path must start with '/', got '{}'",
                self.server.ws_path
            )));
        }

        if self.heartbeat.idle_interval.is_zero() || self.heartbeat.pong_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "heartbeat intervals must be non-zero".to_string(),
            ));
        }
        if self.heartbeat.pong_timeout >= self.heartbeat.idle_interval {
            return Err(ConfigError::Validation(
                "heartbeat.pong_timeout must be shorter than heartbeat.idle_interval".to_string(),
            ));
        }

        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "dispatch.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.dispatch.max_concurrent_sends == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_concurrent_sends must be greater than 0".to_string(),
            ));
        }
        if self.dispatch.send_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "dispatch.send_timeout must be non-zero".to_string(),
            ));
        }

        if self.limits.max_channel_length == 0 {
            return Err(ConfigError::Validation(
                "limits.max_channel_length must be greater than 0".to_string(),
            ));
        }

        self.pubsub.validate()?;

        if self.lifecycle.restart_backoff.is_zero() {
            return Err(ConfigError::Validation(
                "lifecycle.restart_backoff must be non-zero".to_string(),
            ));
        }
        if self.lifecycle.restart_backoff > self.lifecycle.max_restart_backoff {
            return Err(ConfigError::Validation(
                "lifecycle.restart_backoff cannot exceed lifecycle.max_restart_backoff"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
