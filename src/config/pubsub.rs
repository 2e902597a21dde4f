//! Pub/Sub Transport Configuration
//!
//! Selects the external publish/subscribe system that job events arrive on.

use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;
use crate::protocol::topic_for;

/// Pub/sub backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubBackend {
    /// Redis PSUBSCRIBE/PUBLISH
    #[default]
    Redis,
    /// In-process transport (single binary, tests)
    Memory,
}

impl std::fmt::Display for PubSubBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubBackend::Redis => write!(f, "redis"),
            PubSubBackend::Memory => write!(f, "memory"),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_namespace() -> String {
    "websocket".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Pub/sub transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Backend type
    pub backend: PubSubBackend,
    /// Connection URL (redis backend only)
    #[serde(default = "default_url")]
    pub url: String,
    /// Topic namespace; events arrive on `<namespace>:<channel_id>`
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Timeout for establishing the transport connection
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            backend: PubSubBackend::Redis,
            url: default_url(),
            namespace: default_namespace(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl PubSubConfig {
    /// Pattern matching every job channel in the namespace
    pub fn pattern(&self) -> String {
        topic_for(&self.namespace, "*")
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::Validation(
                "pubsub.namespace cannot be empty".to_string(),
            ));
        }
        if self.namespace.contains(':') {
            return Err(ConfigError::Validation(format!(
                "pubsub.namespace '{}' cannot contain ':'",
                self.namespace
            )));
        }
        if self.backend == PubSubBackend::Redis && self.url.is_empty() {
            return Err(ConfigError::Validation(
                "pubsub.url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}
