//! Runtime configuration.
//!
//! Every struct has a `Default` and deserializes from partial JSON, so a
//! deployment only spells out what it changes:
//!
//! ```json
//! { "bind_addr": "0.0.0.0:9090", "retry": { "max_attempts": 8 } }
//! ```
//!
//! Durations travel as integer milliseconds in `*_ms` fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_core::ChunkConfig;

use crate::error::CollabError;
use crate::reliability::{Liveness, RetryPolicy};

/// Serde adapter for `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Heartbeat-driven liveness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often a session sweeps its users.
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    /// Silence after which a user becomes Idle.
    #[serde(rename = "idle_after_ms", with = "duration_ms")]
    pub idle_after: Duration,
    /// Silence after which a user becomes Disconnected.
    #[serde(rename = "disconnect_after_ms", with = "duration_ms")]
    pub disconnect_after: Duration,
    /// How long a Disconnected user record is kept for reconnection.
    #[serde(rename = "reconnect_grace_ms", with = "duration_ms")]
    pub reconnect_grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            idle_after: Duration::from_secs(30),
            disconnect_after: Duration::from_secs(120),
            reconnect_grace: Duration::from_secs(300),
        }
    }
}

impl HeartbeatConfig {
    pub fn liveness(&self) -> Liveness {
        Liveness {
            idle_after: self.idle_after,
            disconnect_after: self.disconnect_after,
        }
    }
}

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Operations retained per document for transform and replay.
    pub history_limit: usize,
    /// Chat entries retained and sent to joining users.
    pub chat_history_limit: usize,
    pub chunk: ChunkConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            chat_history_limit: 100,
            chunk: ChunkConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Connection pool housekeeping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections with no inbound traffic for this long are closed.
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Outbound frames buffered per connection.
    pub outbound_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            outbound_capacity: 1024,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub session: SessionConfig,
    pub retry: RetryPolicy,
    pub pool: PoolConfig,
    /// How long an empty session survives before teardown.
    #[serde(rename = "session_grace_ms", with = "duration_ms")]
    pub session_grace: Duration,
    /// How often empty sessions are looked for.
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Commands buffered per session actor.
    pub command_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
            retry: RetryPolicy::default(),
            pool: PoolConfig::default(),
            session_grace: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
            command_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Parse a (possibly partial) JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, CollabError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Client connection behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Reconnect backoff; `max_attempts` bounds consecutive failures.
    pub reconnect: RetryPolicy,
    pub auto_reconnect: bool,
    /// Events buffered for the application.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            reconnect: RetryPolicy::default(),
            auto_reconnect: true,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.session.chunk.threshold, 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.session.heartbeat.idle_after < config.session.heartbeat.disconnect_after);
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = ServerConfig::from_json_str(
            r#"{
                "bind_addr": "0.0.0.0:7000",
                "session_grace_ms": 1500,
                "retry": { "max_attempts": 2 },
                "session": { "history_limit": 10, "heartbeat": { "idle_after_ms": 250 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.session_grace, Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_interval, RetryPolicy::default().initial_interval);
        assert_eq!(config.session.history_limit, 10);
        assert_eq!(config.session.heartbeat.idle_after, Duration::from_millis(250));
        assert_eq!(config.session.chat_history_limit, 100);
    }

    #[test]
    fn test_invalid_json_is_protocol_error() {
        let err = ServerConfig::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.code(), "protocol_error");
    }

    #[test]
    fn test_round_trip_uses_millis() {
        let json = serde_json::to_value(PoolConfig::default()).unwrap();
        assert_eq!(json["idle_timeout_ms"], 600_000);
        assert_eq!(json["cleanup_interval_ms"], 60_000);
    }

    #[test]
    fn test_client_config_partial() {
        let json = r#"{ "heartbeat_interval_ms": 250, "auto_reconnect": false }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert!(!config.auto_reconnect);
        assert_eq!(config.event_capacity, 256);
    }
}
