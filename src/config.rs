// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the fan-out server.
//!
//! Configuration is passed to [`FanoutServer`](crate::FanoutServer) and can be
//! constructed programmatically, deserialized with serde, or read from the
//! environment with [`FanoutConfig::from_env()`].
//!
//! # Quick Start
//!
//! ```rust
//! use fanout_engine::config::FanoutConfig;
//!
//! let mut config = FanoutConfig::default();
//! config.server.port = 9000;
//! config.history.depth = 10;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! FanoutConfig
//! ├── server: ServerConfig     # WebSocket listener
//! ├── store: StoreConfig       # Redis keys + change channel
//! └── history: HistoryConfig   # publish interval × depth = client expiry
//! ```
//!
//! # Environment
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `WEBSOCKET_HOST` | `server.host` | `0.0.0.0` |
//! | `WEBSOCKET_SERVER_PORT` | `server.port` | `8000` |
//! | `WEBSOCKET_PATH` | `server.path_prefix` | none |
//! | `MAX_CONNECTIONS` | `server.max_connections` | `10000` |
//! | `REDIS_HOSTNAME` | `store.host` | `127.0.0.1` |
//! | `REDIS_PORT` | `store.port` | `6379` |
//! | `REDIS_PREFIX` | `store.key_prefix` | none |
//! | `REALTIME_FREQ` | `history.publish_interval` | `15s` |
//! | `REALTIME_DATA_DICT_CAP` | `history.depth` | `20` |

use crate::error::{FanoutError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on `publish_interval × depth`.
pub const MAX_EXPIRATION_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `FanoutServer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// WebSocket listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store (Redis) location, keys and change channel.
    #[serde(default)]
    pub store: StoreConfig,

    /// Producer cadence and diff history depth.
    #[serde(default)]
    pub history: HistoryConfig,
}

impl FanoutConfig {
    /// Create a config for tests: ephemeral port on localhost, short history.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..Default::default()
            },
            store: StoreConfig::default(),
            history: HistoryConfig {
                publish_interval: "1s".to_string(),
                depth: 3,
            },
        }
    }

    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    ///
    /// Unset variables keep their defaults; set-but-unparsable variables
    /// are a [`FanoutError::Config`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("WEBSOCKET_HOST") {
            config.server.host = host;
        }
        if let Some(port) = lookup("WEBSOCKET_SERVER_PORT") {
            config.server.port = parse_env("WEBSOCKET_SERVER_PORT", &port)?;
        }
        if let Some(path) = lookup("WEBSOCKET_PATH") {
            config.server.path_prefix = non_empty(path);
        }
        if let Some(max) = lookup("MAX_CONNECTIONS") {
            config.server.max_connections = parse_env("MAX_CONNECTIONS", &max)?;
        }
        if let Some(host) = lookup("REDIS_HOSTNAME") {
            config.store.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            config.store.port = parse_env("REDIS_PORT", &port)?;
        }
        if let Some(prefix) = lookup("REDIS_PREFIX") {
            config.store.key_prefix = non_empty(prefix);
        }
        if let Some(freq) = lookup("REALTIME_FREQ") {
            config.history.publish_interval = normalize_interval(&freq)?;
        }
        if let Some(cap) = lookup("REALTIME_DATA_DICT_CAP") {
            config.history.depth = parse_env("REALTIME_DATA_DICT_CAP", &cap)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(FanoutError::Config(
                "server.max_connections must be > 0".to_string(),
            ));
        }
        if let Some(prefix) = &self.server.path_prefix {
            if !prefix.starts_with('/') {
                return Err(FanoutError::Config(format!(
                    "server.path_prefix must start with '/': {}",
                    prefix
                )));
            }
        }
        if self.store.host.is_empty() {
            return Err(FanoutError::Config("store.host is empty".to_string()));
        }
        if self.store.port == 0 {
            return Err(FanoutError::Config("store.port must be > 0".to_string()));
        }
        if self.store.new_data_token.is_empty() {
            return Err(FanoutError::Config(
                "store.new_data_token is empty".to_string(),
            ));
        }
        if self.history.depth == 0 {
            return Err(FanoutError::Config(
                "history.depth must be > 0".to_string(),
            ));
        }
        let interval = match humantime::parse_duration(&self.history.publish_interval) {
            Ok(d) if d.is_zero() => {
                return Err(FanoutError::Config(
                    "history.publish_interval must be > 0".to_string(),
                ))
            }
            Ok(d) => d,
            Err(e) => {
                return Err(FanoutError::Config(format!(
                    "history.publish_interval {:?}: {}",
                    self.history.publish_interval, e
                )))
            }
        };
        let window = u32::try_from(self.history.depth)
            .ok()
            .and_then(|depth| interval.checked_mul(depth));
        match window {
            Some(window) if window <= MAX_EXPIRATION_WINDOW => Ok(()),
            _ => Err(FanoutError::Config(format!(
                "history.publish_interval × history.depth exceeds {}",
                humantime::format_duration(MAX_EXPIRATION_WINDOW)
            ))),
        }
    }

    /// How long a disconnected client is remembered before eviction.
    pub fn expiration_window(&self) -> Duration {
        self.history.expiration_window()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| FanoutError::Config(format!("{}={:?}: {}", key, value, e)))
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Accept plain seconds ("15", "2.5") as well as humantime ("15s", "1m").
fn normalize_interval(value: &str) -> Result<String> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(FanoutError::Config(format!(
                "REALTIME_FREQ must be a positive number of seconds: {:?}",
                value
            )));
        }
        let duration = Duration::try_from_secs_f64(secs).map_err(|e| {
            FanoutError::Config(format!("REALTIME_FREQ={:?}: {}", value, e))
        })?;
        return Ok(humantime::format_duration(duration).to_string());
    }
    humantime::parse_duration(value)
        .map(|_| value.to_string())
        .map_err(|e| FanoutError::Config(format!("REALTIME_FREQ={:?}: {}", value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig: WebSocket listener
// ═══════════════════════════════════════════════════════════════════════════════

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind. `0` picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional request path prefix (e.g. `"/ws"`).
    /// Connections to other paths are refused with 404.
    #[serde(default)]
    pub path_prefix: Option<String>,

    /// Upper bound on concurrently open client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// How long shutdown waits for connection tasks to close (seconds).
    #[serde(default = "default_drain_timeout_sec")]
    pub drain_timeout_sec: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_drain_timeout_sec() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path_prefix: None,
            max_connections: default_max_connections(),
            drain_timeout_sec: default_drain_timeout_sec(),
        }
    }
}

impl ServerConfig {
    /// Address string for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown drain timeout as a Duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: Redis keys and change channel
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared store configuration.
///
/// The producer owns these keys; this server only reads them (plus the
/// publish helper used by tests and producers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis hostname.
    #[serde(default = "default_store_host")]
    pub host: String,

    /// Redis port.
    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Optional key prefix shared with the producer (e.g. `"mta:"`).
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Pub/sub channel the producer posts to after each write.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// The literal payload meaning "new data is available".
    #[serde(default = "default_new_data_token")]
    pub new_data_token: String,

    /// Per-attempt timeout for the startup connection (e.g. `"5s"`).
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_store_host() -> String {
    "127.0.0.1".to_string()
}

fn default_store_port() -> u16 {
    6379
}

fn default_channel() -> String {
    "realtime:updates".to_string()
}

fn default_new_data_token() -> String {
    "new_data".to_string()
}

fn default_connection_timeout() -> String {
    "5s".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            key_prefix: None,
            channel: default_channel(),
            new_data_token: default_new_data_token(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl StoreConfig {
    /// Redis connection URL.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }

    fn prefixed(&self, key: &str) -> String {
        let prefix = self.key_prefix.as_deref().unwrap_or("");
        format!("{}{}", prefix, key)
    }

    /// Key holding the current timestamp.
    pub fn timestamp_key(&self) -> String {
        self.prefixed("realtime:current_timestamp")
    }

    /// Key holding the full snapshot blob.
    pub fn full_key(&self) -> String {
        self.prefixed("realtime:data_full")
    }

    /// Hash key holding origin timestamp → diff blob.
    pub fn diffs_key(&self) -> String {
        self.prefixed("realtime:data_diffs")
    }

    /// Change notification channel.
    pub fn channel_name(&self) -> String {
        self.prefixed(&self.channel)
    }

    /// Parse the connection timeout, falling back to 5 seconds.
    pub fn connection_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connection_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HistoryConfig: producer cadence and diff retention
// ═══════════════════════════════════════════════════════════════════════════════

/// Diff history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// How often the producer publishes (humantime string, e.g. `"15s"`).
    #[serde(default = "default_publish_interval")]
    pub publish_interval: String,

    /// Number of diff origins retained.
    #[serde(default = "default_depth")]
    pub depth: usize,
}

fn default_publish_interval() -> String {
    "15s".to_string()
}

fn default_depth() -> usize {
    20
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            publish_interval: default_publish_interval(),
            depth: default_depth(),
        }
    }
}

impl HistoryConfig {
    /// Parse the publish interval, falling back to 15 seconds.
    pub fn publish_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.publish_interval).unwrap_or(Duration::from_secs(15))
    }

    /// `publish_interval × depth`: after this long, every diff a client
    /// could still apply has been evicted by the producer.
    pub fn expiration_window(&self) -> Duration {
        self.publish_interval_duration()
            .saturating_mul(self.depth.min(u32::MAX as usize) as u32)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = FanoutConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.store.redis_url(), "redis://127.0.0.1:6379");
        assert_eq!(config.history.depth, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expiration_window() {
        let config = FanoutConfig::default();
        assert_eq!(config.expiration_window(), Duration::from_secs(15 * 20));

        let history = HistoryConfig {
            publish_interval: "500ms".to_string(),
            depth: 4,
        };
        assert_eq!(history.expiration_window(), Duration::from_secs(2));
    }

    #[test]
    fn test_store_keys_with_prefix() {
        let store = StoreConfig {
            key_prefix: Some("mta:".to_string()),
            ..Default::default()
        };
        assert_eq!(store.timestamp_key(), "mta:realtime:current_timestamp");
        assert_eq!(store.full_key(), "mta:realtime:data_full");
        assert_eq!(store.diffs_key(), "mta:realtime:data_diffs");
        assert_eq!(store.channel_name(), "mta:realtime:updates");
    }

    #[test]
    fn test_store_keys_without_prefix() {
        let store = StoreConfig::default();
        assert_eq!(store.timestamp_key(), "realtime:current_timestamp");
        assert_eq!(store.channel_name(), "realtime:updates");
        assert_eq!(store.new_data_token, "new_data");
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = FanoutConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.store.host, "127.0.0.1");
    }

    #[test]
    fn test_from_lookup_reads_all_variables() {
        let config = FanoutConfig::from_lookup(lookup_from(&[
            ("WEBSOCKET_HOST", "127.0.0.1"),
            ("WEBSOCKET_SERVER_PORT", "9000"),
            ("WEBSOCKET_PATH", "/ws"),
            ("MAX_CONNECTIONS", "50"),
            ("REDIS_HOSTNAME", "redis_server"),
            ("REDIS_PORT", "6380"),
            ("REDIS_PREFIX", "nyc:"),
            ("REALTIME_FREQ", "10"),
            ("REALTIME_DATA_DICT_CAP", "5"),
        ]))
        .unwrap();

        assert_eq!(config.server.bind_addr(), "127.0.0.1:9000");
        assert_eq!(config.server.path_prefix.as_deref(), Some("/ws"));
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.store.redis_url(), "redis://redis_server:6380");
        assert_eq!(config.store.full_key(), "nyc:realtime:data_full");
        assert_eq!(config.history.publish_interval_duration(), Duration::from_secs(10));
        assert_eq!(config.history.depth, 5);
        assert_eq!(config.expiration_window(), Duration::from_secs(50));
    }

    #[test]
    fn test_from_lookup_fractional_and_humantime_interval() {
        let config =
            FanoutConfig::from_lookup(lookup_from(&[("REALTIME_FREQ", "2.5")])).unwrap();
        assert_eq!(
            config.history.publish_interval_duration(),
            Duration::from_millis(2500)
        );

        let config =
            FanoutConfig::from_lookup(lookup_from(&[("REALTIME_FREQ", "1m")])).unwrap();
        assert_eq!(config.history.publish_interval_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = FanoutConfig::from_lookup(lookup_from(&[("REDIS_PORT", "six")])).unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));
        assert!(err.to_string().contains("REDIS_PORT"));

        let err =
            FanoutConfig::from_lookup(lookup_from(&[("REALTIME_FREQ", "-3")])).unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));

        let err = FanoutConfig::from_lookup(lookup_from(&[("REALTIME_DATA_DICT_CAP", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn test_from_lookup_rejects_huge_interval() {
        let err =
            FanoutConfig::from_lookup(lookup_from(&[("REALTIME_FREQ", "1e30")])).unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));
        assert!(err.to_string().contains("REALTIME_FREQ"));
    }

    #[test]
    fn test_validate_caps_expiration_window() {
        let err =
            FanoutConfig::from_lookup(lookup_from(&[("REALTIME_FREQ", "1e18")])).unwrap_err();
        assert!(matches!(err, FanoutError::Config(_)));

        let mut config = FanoutConfig::default();
        config.history.publish_interval = "1day".to_string();
        config.history.depth = 7;
        assert!(config.validate().is_ok());
        config.history.depth = 8;
        assert!(config.validate().is_err());

        config.history.publish_interval = "1s".to_string();
        config.history.depth = usize::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_path_prefix_is_none() {
        let config = FanoutConfig::from_lookup(lookup_from(&[("WEBSOCKET_PATH", "")])).unwrap();
        assert!(config.server.path_prefix.is_none());
    }

    #[test]
    fn test_validate_path_prefix_needs_slash() {
        let mut config = FanoutConfig::default();
        config.server.path_prefix = Some("ws".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = FanoutConfig::default();
        config.history.publish_interval = "0s".to_string();
        assert!(config.validate().is_err());

        config.history.publish_interval = "soon".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_for_testing_config() {
        let config = FanoutConfig::for_testing();
        assert_eq!(config.server.port, 0);
        assert_eq!(config.expiration_window(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_timeout_fallback() {
        let store = StoreConfig {
            connection_timeout: "nonsense".to_string(),
            ..Default::default()
        };
        assert_eq!(store.connection_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = FanoutConfig::default();
        config.server.path_prefix = Some("/ws".to_string());
        config.history.depth = 7;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: FanoutConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.server.path_prefix.as_deref(), Some("/ws"));
        assert_eq!(parsed.history.depth, 7);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let parsed: FanoutConfig =
            serde_json::from_str(r#"{"history": {"depth": 3}}"#).unwrap();
        assert_eq!(parsed.history.depth, 3);
        assert_eq!(parsed.history.publish_interval, "15s");
        assert_eq!(parsed.server.port, 8000);
    }
}
