//! Client configuration.
//!
//! Durations are carried as integer milliseconds so a config file stays
//! plain JSON:
//!
//! ```json
//! {
//!   "call_timeout_ms": 10000,
//!   "queue_capacity": 1024,
//!   "reconnect": { "delay_ms": 5000, "jitter_ms": 500 },
//!   "keepalive": { "api": ".lq.Lobby.heatbeat", "interval_ms": 6000 }
//! }
//! ```
//!
//! Every field has a default, so `{}` is a valid config.

use std::path::Path;
use std::time::Duration;

use mjwire_protocol::ACTION_PROTOTYPE;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline applied by `call` when no context is passed.
    pub call_timeout_ms: u64,

    /// Capacity of the bounded push queue between the read loop and the
    /// dispatcher.
    pub queue_capacity: usize,

    /// How long a full queue may hold the read loop before a backpressure
    /// warning is logged. The wait then resumes; nothing is dropped.
    pub overflow_warn_ms: u64,

    /// Capacity of the passive subscriber queue. 0 disables it.
    pub subscriber_capacity: usize,

    /// Notify name whose payload carries the action sub-protocol.
    pub action_notify_name: String,

    /// What to do when an established connection is lost.
    pub reconnect: ReconnectConfig,

    /// Optional heartbeat call.
    pub keepalive: Option<KeepaliveConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 10_000,
            queue_capacity: 1_024,
            overflow_warn_ms: 1_000,
            subscriber_capacity: 0,
            action_notify_name: ACTION_PROTOTYPE.to_string(),
            reconnect: ReconnectConfig::default(),
            keepalive: None,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON config.
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed JSON, [`ConfigError::Invalid`]
    /// on unusable values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.check()?;
        Ok(config.validated())
    }

    /// Reads and parses a JSON config file.
    ///
    /// # Errors
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Rejects values that cannot be clamped into something usable.
    pub(crate) fn check(&self) -> Result<(), ConfigError> {
        if self.action_notify_name.is_empty() {
            return Err(ConfigError::Invalid(
                "action_notify_name must not be empty".into(),
            ));
        }
        if let Some(keepalive) = &self.keepalive {
            if keepalive.api.is_empty() {
                return Err(ConfigError::Invalid(
                    "keepalive.api must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Clamps out-of-range values so the config is safe to use.
    ///
    /// Called by the client builder. Rules:
    /// - `call_timeout_ms`, `overflow_warn_ms`, `queue_capacity` raised to 1
    /// - `keepalive.interval_ms` raised to 100, `keepalive.max_missed` to 1
    pub fn validated(mut self) -> Self {
        if self.call_timeout_ms == 0 {
            tracing::warn!("call_timeout_ms is 0, using 1");
            self.call_timeout_ms = 1;
        }
        if self.queue_capacity == 0 {
            tracing::warn!("queue_capacity is 0, using 1");
            self.queue_capacity = 1;
        }
        if self.overflow_warn_ms == 0 {
            tracing::warn!("overflow_warn_ms is 0, using 1");
            self.overflow_warn_ms = 1;
        }
        if let Some(keepalive) = &mut self.keepalive {
            if keepalive.interval_ms < KeepaliveConfig::MIN_INTERVAL_MS {
                tracing::warn!(
                    interval_ms = keepalive.interval_ms,
                    min = KeepaliveConfig::MIN_INTERVAL_MS,
                    "keepalive interval below minimum, clamping"
                );
                keepalive.interval_ms = KeepaliveConfig::MIN_INTERVAL_MS;
            }
            keepalive.max_missed = keepalive.max_missed.max(1);
        }
        self
    }

    /// Default call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Backpressure warning period.
    pub fn overflow_warn(&self) -> Duration {
        Duration::from_millis(self.overflow_warn_ms)
    }
}

// ---------------------------------------------------------------------------
// ReconnectConfig
// ---------------------------------------------------------------------------

/// Reconnection policy: a fixed delay, retried until success or close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether a lost connection is re-established at all.
    pub enabled: bool,

    /// Pause before each attempt.
    pub delay_ms: u64,

    /// Upper bound of the random extra pause added to `delay_ms`.
    pub jitter_ms: u64,

    /// Also reconnect after the remote side closes the link cleanly.
    pub on_remote_close: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_ms: 5_000,
            jitter_ms: 0,
            on_remote_close: false,
        }
    }
}

impl ReconnectConfig {
    /// The pause before the next attempt, jitter included.
    pub fn next_delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.delay_ms + jitter)
    }
}

// ---------------------------------------------------------------------------
// KeepaliveConfig
// ---------------------------------------------------------------------------

/// Periodic heartbeat call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Method name of the heartbeat call. Its request and response are
    /// sent and read as empty messages.
    pub api: String,

    /// Time between heartbeats; also the deadline of each heartbeat.
    #[serde(default = "KeepaliveConfig::default_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failures after which the link is dropped.
    #[serde(default = "KeepaliveConfig::default_max_missed")]
    pub max_missed: u32,
}

impl KeepaliveConfig {
    /// Smallest accepted interval.
    pub const MIN_INTERVAL_MS: u64 = 100;

    fn default_interval_ms() -> u64 {
        6_000
    }

    fn default_max_missed() -> u32 {
        3
    }

    /// A heartbeat on `api` with default timing.
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            interval_ms: Self::default_interval_ms(),
            max_missed: Self::default_max_missed(),
        }
    }

    /// Time between heartbeats.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        let config = ClientConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.action_notify_name, ".lq.ActionPrototype");
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{
                "queue_capacity": 16,
                "reconnect": { "jitter_ms": 250 },
                "keepalive": { "api": ".lq.Lobby.heatbeat" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.reconnect.delay_ms, 5_000);
        assert_eq!(config.reconnect.jitter_ms, 250);
        assert!(config.reconnect.enabled);

        let keepalive = config.keepalive.unwrap();
        assert_eq!(keepalive.interval_ms, 6_000);
        assert_eq!(keepalive.max_missed, 3);
    }

    #[test]
    fn test_validated_clamps_zeroes() {
        let config = ClientConfig {
            queue_capacity: 0,
            overflow_warn_ms: 0,
            keepalive: Some(KeepaliveConfig {
                api: "hb".into(),
                interval_ms: 5,
                max_missed: 0,
            }),
            ..ClientConfig::default()
        }
        .validated();
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.overflow_warn_ms, 1);
        let keepalive = config.keepalive.unwrap();
        assert_eq!(keepalive.interval_ms, KeepaliveConfig::MIN_INTERVAL_MS);
        assert_eq!(keepalive.max_missed, 1);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = ClientConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_keepalive_without_api_is_invalid() {
        let err =
            ClientConfig::from_json_str(r#"{ "keepalive": { "api": "" } }"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ClientConfig::from_json_file("/nonexistent/mjwire.json")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let reconnect = ReconnectConfig {
            delay_ms: 100,
            jitter_ms: 50,
            ..ReconnectConfig::default()
        };
        for _ in 0..100 {
            let delay = reconnect.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
