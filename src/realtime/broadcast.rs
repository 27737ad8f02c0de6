//! # Broadcast Relay
//!
//! Outbound admission (rate and size limits) for user messages, and
//! construction of inbound broadcast events. Nothing is cached.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};
use super::event::BroadcastMessage;

/// Broadcast limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Maximum messages per second, per topic
    pub max_per_second: usize,
    /// Maximum serialized payload size in bytes
    pub max_message_size: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            max_per_second: 10,
            max_message_size: 65536, // 64KB
        }
    }
}

/// Relay for broadcast topics
#[derive(Debug)]
pub struct BroadcastRelay {
    config: BroadcastConfig,

    /// Rate limit tracking (topic -> (count, window_start))
    rate_limits: Mutex<HashMap<String, (usize, DateTime<Utc>)>>,
}

impl BroadcastRelay {
    /// Create a relay with the given limits
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            rate_limits: Mutex::new(HashMap::new()),
        }
    }

    /// Check that a message may be sent on `topic`
    pub fn admit(&self, topic: &str, payload: &Value) -> RealtimeResult<()> {
        let payload_size = serde_json::to_string(payload)
            .map(|s| s.len())
            .map_err(|e| RealtimeError::InvalidMessage(e.to_string()))?;

        if payload_size > self.config.max_message_size {
            return Err(RealtimeError::MessageTooLarge(self.config.max_message_size));
        }

        self.check_rate_limit(topic)
    }

    fn check_rate_limit(&self, topic: &str) -> RealtimeResult<()> {
        let now = Utc::now();

        let mut limits = self
            .rate_limits
            .lock()
            .map_err(|_| RealtimeError::Internal("Lock poisoned".into()))?;

        let entry = limits.entry(topic.to_string()).or_insert((0, now));

        // Reset if in new window
        if (now - entry.1).num_seconds() >= 1 {
            entry.0 = 0;
            entry.1 = now;
        }

        if entry.0 >= self.config.max_per_second {
            return Err(RealtimeError::RateLimitExceeded);
        }

        entry.0 += 1;
        Ok(())
    }

    /// Forget rate state for a topic whose channel closed
    pub fn forget(&self, topic: &str) {
        if let Ok(mut limits) = self.rate_limits.lock() {
            limits.remove(topic);
        }
    }

    /// Build the event delivered to subscribers for an inbound message
    pub fn on_message(&self, topic: &str, event: String, payload: Value) -> BroadcastMessage {
        BroadcastMessage {
            topic: topic.to_string(),
            event,
            payload,
            received_at: Utc::now(),
        }
    }
}

impl Default for BroadcastRelay {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rate_limit() {
        let relay = BroadcastRelay::default();

        for i in 0..10 {
            assert!(relay.admit("chat", &json!({"i": i})).is_ok());
        }

        assert!(matches!(
            relay.admit("chat", &json!({})),
            Err(RealtimeError::RateLimitExceeded)
        ));

        // Other topics have their own window
        assert!(relay.admit("cursor", &json!({})).is_ok());
    }

    #[test]
    fn test_forget_resets_window() {
        let relay = BroadcastRelay::new(BroadcastConfig {
            max_per_second: 1,
            ..Default::default()
        });
        relay.admit("chat", &json!({})).unwrap();
        assert!(relay.admit("chat", &json!({})).is_err());

        relay.forget("chat");
        assert!(relay.admit("chat", &json!({})).is_ok());
    }

    #[test]
    fn test_message_size_limit() {
        let relay = BroadcastRelay::default();
        let large_payload = json!({ "data": "x".repeat(100_000) });

        assert!(matches!(
            relay.admit("chat", &large_payload),
            Err(RealtimeError::MessageTooLarge(65536))
        ));
    }

    #[test]
    fn test_on_message() {
        let relay = BroadcastRelay::default();
        let message = relay.on_message("chat", "message".to_string(), json!({"text": "Hi"}));

        assert_eq!(message.topic, "chat");
        assert_eq!(message.event, "message");
        assert_eq!(message.payload["text"], "Hi");
    }
}
