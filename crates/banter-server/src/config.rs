//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BANTER_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use banter_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Engine timing knobs.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Presence behavior.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum distinct users per topic.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_topic: usize,

    /// Maximum topics one session may join.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_session: usize,

    /// Maximum envelope size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-session outbound queue depth.
    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,

    /// One `get data` batch cap.
    #[serde(default = "default_history_batch")]
    pub history_batch_limit: usize,
}

/// Engine timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Deadline for queueing one frame to a session, ms.
    #[serde(default = "default_send_deadline")]
    pub send_deadline_ms: u64,

    /// Deadline for forwarding into a topic inbox, ms.
    #[serde(default = "default_forward_deadline")]
    pub forward_deadline_ms: u64,

    /// Unload a topic this long after its last session leaves, ms.
    #[serde(default = "default_topic_idle")]
    pub topic_idle_timeout_ms: u64,

    /// Minimum interval between typing notifications per user, ms.
    #[serde(default = "default_kp_interval")]
    pub kp_min_interval_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Deliver typing notifications to the sender's other sessions.
    #[serde(default)]
    pub kp_to_own_sessions: bool,
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
    std::env::var("BANTER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BANTER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6060)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/v0/channels".to_string()
}

fn default_max_topics() -> usize {
    10_000
}

fn default_max_subscribers() -> usize {
    128
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    256 * 1024
}

fn default_session_queue_depth() -> usize {
    64
}

fn default_history_batch() -> usize {
    1_024
}

fn default_send_deadline() -> u64 {
    100
}

fn default_forward_deadline() -> u64 {
    250
}

fn default_topic_idle() -> u64 {
    15_000
}

fn default_kp_interval() -> u64 {
    2_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            limits: LimitsConfig::default(),
            timing: TimingConfig::default(),
            presence: PresenceConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_topics: default_max_topics(),
            max_subscribers_per_topic: default_max_subscribers(),
            max_subscriptions_per_session: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            session_queue_depth: default_session_queue_depth(),
            history_batch_limit: default_history_batch(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            send_deadline_ms: default_send_deadline(),
            forward_deadline_ms: default_forward_deadline(),
            topic_idle_timeout_ms: default_topic_idle(),
            kp_min_interval_ms: default_kp_interval(),
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

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "banter.toml",
            "/etc/banter/banter.toml",
            "~/.config/banter/banter.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides.
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

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error when host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Project the engine-relevant parts into an [`EngineConfig`].
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_topics: self.limits.max_topics,
            max_subscribers_per_topic: self.limits.max_subscribers_per_topic,
            max_subscriptions_per_session: self.limits.max_subscriptions_per_session,
            session_queue_depth: self.limits.session_queue_depth,
            history_batch_limit: self.limits.history_batch_limit,
            send_deadline_ms: self.timing.send_deadline_ms,
            forward_deadline_ms: self.timing.forward_deadline_ms,
            topic_idle_timeout_ms: self.timing.topic_idle_timeout_ms,
            kp_min_interval_ms: self.timing.kp_min_interval_ms,
            kp_to_own_sessions: self.presence.kp_to_own_sessions,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 6060);
        assert_eq!(config.limits.session_queue_depth, 64);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 7070

            [limits]
            max_topics = 500

            [timing]
            send_deadline_ms = 50

            [presence]
            kp_to_own_sessions = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7070);
        assert_eq!(config.limits.max_topics, 500);
        assert_eq!(config.timing.send_deadline_ms, 50);
        assert!(config.presence.kp_to_own_sessions);
    }

    #[test]
    fn test_engine_config_projection() {
        let config = Config::default();
        let engine = config.engine_config();
        assert_eq!(engine.session_queue_depth, config.limits.session_queue_depth);
        assert_eq!(engine.send_deadline_ms, config.timing.send_deadline_ms);
    }
}
