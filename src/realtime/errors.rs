//! # Real-Time Errors
//!
//! Error types for the real-time module.

use thiserror::Error;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Real-time errors
///
/// `Clone` so that a single failed channel open can be handed to every
/// consumer that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    // ==================
    // Transport Errors
    // ==================
    /// Transport could not open a channel
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Channel was closed before the operation completed
    #[error("Channel closed")]
    ChannelClosed,

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    // ==================
    // Store Errors
    // ==================
    /// Initial snapshot fetch failed
    #[error("Snapshot fetch failed: {0}")]
    SnapshotFailed(String),

    // ==================
    // Subscription Errors
    // ==================
    /// Invalid entity, room or topic name
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Too many subscribers on one channel
    #[error("Too many subscriptions (max: {0})")]
    TooManySubscriptions(usize),

    // ==================
    // Broadcast Errors
    // ==================
    /// No live channel for the topic
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Message too large
    #[error("Message too large (max: {0} bytes)")]
    MessageTooLarge(usize),

    // ==================
    // Internal Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Stable error code used in structured logs
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::TransportUnavailable(_) => "AERO_RT_TRANSPORT_UNAVAILABLE",
            RealtimeError::ChannelClosed => "AERO_RT_CHANNEL_CLOSED",
            RealtimeError::InvalidMessage(_) => "AERO_RT_INVALID_MESSAGE",
            RealtimeError::ConnectionError(_) => "AERO_RT_CONNECTION_ERROR",
            RealtimeError::SnapshotFailed(_) => "AERO_RT_SNAPSHOT_FAILED",
            RealtimeError::InvalidTopic(_) => "AERO_RT_INVALID_TOPIC",
            RealtimeError::TooManySubscriptions(_) => "AERO_RT_TOO_MANY_SUBSCRIPTIONS",
            RealtimeError::ChannelNotFound(_) => "AERO_RT_CHANNEL_NOT_FOUND",
            RealtimeError::RateLimitExceeded => "AERO_RT_RATE_LIMITED",
            RealtimeError::MessageTooLarge(_) => "AERO_RT_MESSAGE_TOO_LARGE",
            RealtimeError::ConfigError(_) => "AERO_RT_CONFIG_ERROR",
            RealtimeError::Internal(_) => "AERO_RT_INTERNAL",
        }
    }

    /// Whether a fresh attempt of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::TransportUnavailable(_)
                | RealtimeError::ChannelClosed
                | RealtimeError::ConnectionError(_)
                | RealtimeError::RateLimitExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RealtimeError::TransportUnavailable("down".into()).code(),
            "AERO_RT_TRANSPORT_UNAVAILABLE"
        );
        assert_eq!(RealtimeError::RateLimitExceeded.code(), "AERO_RT_RATE_LIMITED");
        assert_eq!(RealtimeError::ChannelClosed.code(), "AERO_RT_CHANNEL_CLOSED");
    }

    #[test]
    fn test_retryable() {
        assert!(RealtimeError::TransportUnavailable("x".into()).is_retryable());
        assert!(!RealtimeError::InvalidTopic("x".into()).is_retryable());
        assert!(!RealtimeError::MessageTooLarge(10).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = RealtimeError::TooManySubscriptions(5);
        assert_eq!(err.to_string(), "Too many subscriptions (max: 5)");
    }
}
