//! # Subscriptions
//!
//! A `Subscriber` is the registry's record of one consumer callback on a
//! channel. A `Subscription` is the consumer's handle to it; releasing the
//! handle (explicitly or by dropping it) removes the callback from fan-out
//! immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;

use super::channel::ChannelKey;
use super::event::{Event, EventKind};
use super::presence::PresenceMeta;
use super::registry::ChannelRegistry;

/// Error returned by a subscriber callback
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a subscriber callback
pub type CallbackResult = Result<(), CallbackError>;

pub(crate) type Callback = Arc<dyn Fn(&Event) -> CallbackResult + Send + Sync>;

pub(crate) fn callback<F>(f: F) -> Callback
where
    F: Fn(&Event) -> CallbackResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Unique subscription ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// State the channel's cache started from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialState {
    /// Seeded by the snapshot (or nothing to seed)
    Seeded,
    /// Live events flow, but the initial state is incomplete
    Degraded { reason: String },
}

/// Registry-side record of one consumer
pub(crate) struct Subscriber {
    pub(crate) id: SubscriptionId,
    pub(crate) kind: EventKind,
    /// Participant key this subscriber tracks presence for
    pub(crate) tracks: Option<String>,
    callback: Callback,
    active: AtomicBool,
}

impl Subscriber {
    pub(crate) fn new(
        id: SubscriptionId,
        kind: EventKind,
        tracks: Option<String>,
        callback: Callback,
    ) -> Self {
        Self {
            id,
            kind,
            tracks,
            callback,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn invoke(&self, event: &Event) -> CallbackResult {
        (self.callback)(event)
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tracks", &self.tracks)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Consumer handle for a registered interest
///
/// Dropping the handle releases it; releasing twice is a no-op.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    key: ChannelKey,
    kind: EventKind,
    initial: InitialState,
    registry: Weak<ChannelRegistry>,
    released: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        key: ChannelKey,
        kind: EventKind,
        initial: InitialState,
        registry: Weak<ChannelRegistry>,
    ) -> Self {
        Self {
            id,
            key,
            kind,
            initial,
            registry,
            released: false,
        }
    }

    /// Subscription ID
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel this subscription is attached to
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Kind of events delivered
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Initial state of the channel at registration
    pub fn initial_state(&self) -> &InitialState {
        &self.initial
    }

    /// Whether the channel opened without a complete snapshot
    pub fn is_degraded(&self) -> bool {
        matches!(self.initial, InitialState::Degraded { .. })
    }

    /// Cached records for an entity subscription (empty otherwise)
    pub fn records(&self) -> Vec<Value> {
        self.registry
            .upgrade()
            .and_then(|registry| registry.records(&self.key))
            .unwrap_or_default()
    }

    /// Roster for a presence subscription (empty otherwise)
    pub fn roster(&self) -> BTreeMap<String, PresenceMeta> {
        self.registry
            .upgrade()
            .and_then(|registry| registry.roster(&self.key))
            .unwrap_or_default()
    }

    /// Release explicitly
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::BroadcastMessage;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn message() -> Event {
        Event::Broadcast(BroadcastMessage {
            topic: "chat".to_string(),
            event: "message".to_string(),
            payload: json!({}),
            received_at: Utc::now(),
        })
    }

    #[test]
    fn test_subscriber_invoke_and_deactivate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscriber = Subscriber::new(
            SubscriptionId(1),
            EventKind::Broadcast,
            None,
            callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(subscriber.is_active());
        subscriber.invoke(&message()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscriber.deactivate();
        assert!(!subscriber.is_active());
    }

    #[test]
    fn test_subscription_without_registry() {
        let key = ChannelKey::broadcast("chat").unwrap();
        let sub = Subscription::new(
            SubscriptionId(7),
            key.clone(),
            EventKind::Broadcast,
            InitialState::Seeded,
            Weak::new(),
        );

        assert_eq!(sub.id().to_string(), "sub-7");
        assert_eq!(sub.key(), &key);
        assert!(!sub.is_degraded());
        assert!(sub.records().is_empty());

        // Registry gone: release is a no-op
        sub.release();
    }
}
