//! # Event Dispatcher
//!
//! Classifies raw transport events against the channel they arrived on,
//! applies them to that channel's cached state, and fans the resulting
//! typed events out to subscribers.
//!
//! Fan-out runs over a snapshot of the subscriber list taken by the
//! caller. A subscriber released after the snapshot was taken is skipped;
//! one added after it does not see the event. A failing or panicking
//! callback is logged and counted, and delivery continues.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::broadcast::BroadcastRelay;
use super::channel::{ChannelKey, ChannelScope};
use super::errors::{RealtimeError, RealtimeResult};
use super::event::{Event, RawEvent};
use super::presence::PresenceTracker;
use super::projection::Projection;
use super::subscription::Subscriber;
use crate::observability::{log_event_with_fields, Event as LogEvent, MetricsRegistry};

/// Cached state owned by a channel
#[derive(Debug)]
pub(crate) enum ChannelState {
    Rows {
        entity: String,
        projection: Projection,
    },
    Presence(PresenceTracker),
    Broadcast {
        topic: String,
    },
}

impl ChannelState {
    pub(crate) fn for_scope(scope: &ChannelScope, primary_key: &str) -> Self {
        match scope {
            ChannelScope::Entity { entity, filter } => ChannelState::Rows {
                entity: entity.clone(),
                projection: Projection::new(primary_key, filter.clone()),
            },
            ChannelScope::Presence { room } => ChannelState::Presence(PresenceTracker::new(room.clone())),
            ChannelScope::Broadcast { topic } => ChannelState::Broadcast {
                topic: topic.clone(),
            },
        }
    }

    /// Apply a raw event and return the typed events to fan out, in order
    pub(crate) fn apply(
        &mut self,
        key: &ChannelKey,
        raw: RawEvent,
        relay: &BroadcastRelay,
    ) -> RealtimeResult<Vec<Event>> {
        match (self, raw) {
            (ChannelState::Rows { entity, projection }, RawEvent::PostgresChanges { payload }) => {
                let change = payload.into_row_change()?;
                if change.entity() != entity.as_str() {
                    return Err(RealtimeError::InvalidMessage(format!(
                        "change for '{}' on {}",
                        change.entity(),
                        key
                    )));
                }

                // Uncacheable records are still delivered
                if let Err(e) = projection.apply_event(&change) {
                    log_event_with_fields(
                        LogEvent::InvalidEvent,
                        &[("channel", key.as_str()), ("error", &e.to_string())],
                    );
                }
                Ok(vec![Event::Row(change)])
            }

            (ChannelState::Presence(tracker), RawEvent::PresenceDiff { joins, leaves }) => {
                let mut events = Vec::new();
                for participant in leaves.keys() {
                    if let Some(delta) = tracker.leave(participant) {
                        events.push(Event::Presence(delta));
                    }
                }
                for (participant, meta) in joins {
                    if let Some(delta) = tracker.join(&participant, meta) {
                        events.push(Event::Presence(delta));
                    }
                }
                Ok(events)
            }

            (ChannelState::Presence(tracker), RawEvent::PresenceState { state }) => {
                let deltas = tracker.reconcile(state);
                log_event_with_fields(
                    LogEvent::PresenceReconciled,
                    &[
                        ("channel", key.as_str()),
                        ("changes", &deltas.len().to_string()),
                        ("online", &tracker.count().to_string()),
                    ],
                );
                Ok(deltas.into_iter().map(Event::Presence).collect())
            }

            (ChannelState::Broadcast { topic }, RawEvent::Broadcast { event, payload }) => {
                Ok(vec![Event::Broadcast(relay.on_message(topic, event, payload))])
            }

            (_, raw) => Err(RealtimeError::InvalidMessage(format!(
                "{} event on {}",
                raw.name(),
                key
            ))),
        }
    }
}

/// Result of fanning out one event
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchResult {
    /// Callbacks that returned Ok
    pub delivered: usize,
    /// Subscribers released before their turn
    pub skipped: usize,
    /// Callbacks that returned Err or panicked
    pub failed: usize,
}

/// Deliver `event` to every still-active subscriber, in order
pub(crate) fn fan_out(
    key: &ChannelKey,
    event: &Event,
    subscribers: &[Arc<Subscriber>],
    metrics: &MetricsRegistry,
) -> DispatchResult {
    let mut result = DispatchResult::default();

    for subscriber in subscribers {
        if !subscriber.is_active() {
            result.skipped += 1;
            continue;
        }

        metrics.increment_deliveries();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| subscriber.invoke(event)));

        let failure = match outcome {
            Ok(Ok(())) => {
                result.delivered += 1;
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(&*panic)),
        };

        result.failed += 1;
        metrics.increment_callback_failures();
        log_event_with_fields(
            LogEvent::CallbackFailed,
            &[
                ("channel", key.as_str()),
                ("subscription", &subscriber.id.to_string()),
                ("error", &failure),
            ],
        );
    }

    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
