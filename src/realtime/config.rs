//! # Real-Time Configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::broadcast::BroadcastConfig;
use super::errors::{RealtimeError, RealtimeResult};
use super::projection::DEFAULT_PRIMARY_KEY;
use super::websocket::WebSocketConfig;
use crate::observability::Severity;

/// Configuration for a `Realtime` instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Primary key column of cached records
    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Own participant key for presence (generated when absent)
    #[serde(default)]
    pub participant_key: Option<String>,

    /// Events buffered per channel while its snapshot is in flight
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,

    /// Subscribers allowed on a single channel
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_channel: usize,

    /// Minimum log severity: trace, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Broadcast limits
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// WebSocket transport
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

fn default_primary_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}
fn default_max_buffered_events() -> usize {
    10_000
}
fn default_max_subscribers() -> usize {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            primary_key: default_primary_key(),
            participant_key: None,
            max_buffered_events: default_max_buffered_events(),
            max_subscribers_per_channel: default_max_subscribers(),
            log_level: default_log_level(),
            broadcast: BroadcastConfig::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> RealtimeResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RealtimeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: RealtimeConfig = serde_json::from_str(&content)
            .map_err(|e| RealtimeError::ConfigError(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate field ranges
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.primary_key.is_empty() {
            return Err(RealtimeError::ConfigError("primary_key must not be empty".into()));
        }
        if self.max_buffered_events == 0 {
            return Err(RealtimeError::ConfigError("max_buffered_events must be > 0".into()));
        }
        if self.max_subscribers_per_channel == 0 {
            return Err(RealtimeError::ConfigError(
                "max_subscribers_per_channel must be > 0".into(),
            ));
        }
        if self.broadcast.max_per_second == 0 || self.broadcast.max_message_size == 0 {
            return Err(RealtimeError::ConfigError("broadcast limits must be > 0".into()));
        }
        if matches!(self.participant_key.as_deref(), Some("")) {
            return Err(RealtimeError::ConfigError("participant_key must not be empty".into()));
        }
        self.severity()?;
        self.websocket.validate()
    }

    /// Parsed `log_level`
    pub fn severity(&self) -> RealtimeResult<Severity> {
        Severity::parse(&self.log_level).ok_or_else(|| {
            RealtimeError::ConfigError(format!("Invalid log_level: '{}'", self.log_level))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RealtimeConfig::default();
        assert_eq!(config.primary_key, "id");
        assert_eq!(config.max_buffered_events, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_object_is_default() {
        let config: RealtimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RealtimeConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"primary_key": "uuid", "log_level": "warn", "broadcast": {{"max_per_second": 3}}}}"#
        )
        .unwrap();

        let config = RealtimeConfig::load(file.path()).unwrap();
        assert_eq!(config.primary_key, "uuid");
        assert_eq!(config.severity().unwrap(), Severity::Warn);
        assert_eq!(config.broadcast.max_per_second, 3);
        assert_eq!(config.broadcast.max_message_size, 65536);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = RealtimeConfig {
            max_buffered_events: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RealtimeError::ConfigError(_))));

        let config = RealtimeConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = RealtimeConfig::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(RealtimeError::ConfigError(_))));
    }
}
