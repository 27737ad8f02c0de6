//! # Channel Registry
//!
//! Maps each channel key to at most one live transport channel and the
//! ordered list of local subscribers attached to it.
//!
//! ## Lifecycle
//!
//! A channel is created by the first `acquire` for its key and starts in
//! `Opening`: the transport channel is opened, row changes are requested,
//! and (for entities) the snapshot is fetched. Other `acquire` calls for
//! the same key attach to the opening channel and wait for the outcome
//! instead of opening again. Events that arrive while opening are
//! buffered and replayed in arrival order once the snapshot is applied.
//!
//! The subscriber list is the reference count. Every removal goes through
//! `detach`, which tears the channel down when the list becomes empty.
//!
//! ## Dispatch
//!
//! Inbound events are queued on the channel's inbox. Exactly one caller
//! drains a channel at a time; re-entrant or concurrent deliveries only
//! enqueue, so every subscriber observes a channel's events in arrival
//! order. The registry lock is never held while callbacks run, so callbacks
//! may acquire and release freely.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use super::broadcast::BroadcastRelay;
use super::channel::{ChannelKey, ChannelScope};
use super::config::RealtimeConfig;
use super::dispatcher::{fan_out, ChannelState};
use super::errors::{RealtimeError, RealtimeResult};
use super::event::RawEvent;
use super::presence::PresenceMeta;
use super::subscription::{InitialState, Subscriber, SubscriptionId};
use super::transport::{OutboundMessage, SnapshotStore, Transport, TransportHandle};
use crate::observability::{log_event, log_event_with_fields, Event as LogEvent, MetricsRegistry};

/// Dispatch phase of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Transport open or snapshot in flight; events are buffered
    Opening,
    /// Live, nothing being dispatched
    Idle,
    /// Live, a drainer is fanning out events
    Dispatching,
}

/// Diagnostics for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub key: ChannelKey,
    pub phase: Phase,
    pub subscribers: usize,
    pub buffered: usize,
}

/// Outcome of a successful acquire
#[derive(Debug, Clone)]
pub(crate) struct Acquired {
    pub(crate) handle: TransportHandle,
    pub(crate) initial: InitialState,
}

#[derive(Debug, Clone)]
enum OpenStatus {
    Pending,
    Ready(Acquired),
    Failed(RealtimeError),
}

struct Channel {
    scope: ChannelScope,
    generation: u64,
    handle: Option<TransportHandle>,
    /// Insertion order is fan-out order
    subscribers: Vec<Arc<Subscriber>>,
    state: ChannelState,
    phase: Phase,
    /// Pending raw events tagged with the handle id they arrived on
    inbox: VecDeque<(u64, RawEvent)>,
    overflowed: bool,
    initial: InitialState,
    ready: watch::Sender<OpenStatus>,
}

/// Result of removing one subscriber
enum Detached {
    /// Channel survives; optionally stop tracking presence
    Kept {
        untrack: Option<(TransportHandle, String)>,
    },
    /// Last subscriber left; channel removed from the map
    LastOut(Channel),
}

enum Role {
    Opener(u64),
    Waiter(watch::Receiver<OpenStatus>),
}

/// Registry of live channels
pub struct ChannelRegistry {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn SnapshotStore>,
    relay: BroadcastRelay,
    metrics: MetricsRegistry,
    channels: Mutex<HashMap<ChannelKey, Channel>>,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.list_active_channels())
            .finish()
    }
}

/// Releases a pending acquire's subscriber if its future is dropped
struct AcquireGuard<'a> {
    registry: &'a ChannelRegistry,
    key: &'a ChannelKey,
    id: SubscriptionId,
    opener: Option<u64>,
    armed: bool,
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon(self.key, self.id, self.opener);
        }
    }
}

impl ChannelRegistry {
    /// Create an empty registry
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let relay = BroadcastRelay::new(config.broadcast.clone());
        Self {
            config,
            transport,
            store,
            relay,
            metrics: MetricsRegistry::new(),
            channels: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub(crate) fn relay(&self) -> &BroadcastRelay {
        &self.relay
    }

    pub(crate) fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelKey, Channel>> {
        // Callbacks never run under this lock, so poisoning cannot leave
        // a half-applied mutation behind.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach `subscriber` to the channel for `scope`, opening it if needed
    pub(crate) async fn acquire(
        &self,
        scope: ChannelScope,
        subscriber: Arc<Subscriber>,
    ) -> RealtimeResult<Acquired> {
        let key = scope.key();
        let id = subscriber.id;

        let role = {
            let mut channels = self.channels();
            match channels.get_mut(&key) {
                Some(channel) => {
                    if channel.subscribers.len() >= self.config.max_subscribers_per_channel {
                        return Err(RealtimeError::TooManySubscriptions(
                            self.config.max_subscribers_per_channel,
                        ));
                    }
                    channel.subscribers.push(subscriber);
                    log_event_with_fields(
                        LogEvent::ChannelAttach,
                        &[("channel", key.as_str()), ("subscription", &id.to_string())],
                    );

                    if channel.phase != Phase::Opening {
                        let handle = channel.handle.clone().ok_or_else(|| {
                            RealtimeError::Internal(format!("live channel {} has no handle", key))
                        })?;
                        return Ok(Acquired {
                            handle,
                            initial: channel.initial.clone(),
                        });
                    }
                    Role::Waiter(channel.ready.subscribe())
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (ready, _) = watch::channel(OpenStatus::Pending);
                    let state = ChannelState::for_scope(&scope, &self.config.primary_key);
                    channels.insert(
                        key.clone(),
                        Channel {
                            scope: scope.clone(),
                            generation,
                            handle: None,
                            subscribers: vec![subscriber],
                            state,
                            phase: Phase::Opening,
                            inbox: VecDeque::new(),
                            overflowed: false,
                            initial: InitialState::Seeded,
                            ready,
                        },
                    );
                    Role::Opener(generation)
                }
            }
        };

        let mut guard = AcquireGuard {
            registry: self,
            key: &key,
            id,
            opener: None,
            armed: true,
        };

        let result = match role {
            Role::Opener(generation) => {
                guard.opener = Some(generation);
                self.open_channel(&key, &scope, generation).await
            }
            Role::Waiter(ready) => Self::wait_ready(ready).await,
        };

        // On error the guard detaches the subscriber (a no-op when the
        // failed channel is already gone).
        if result.is_ok() {
            guard.armed = false;
        }
        result
    }

    async fn wait_ready(mut ready: watch::Receiver<OpenStatus>) -> RealtimeResult<Acquired> {
        let status = ready
            .wait_for(|status| !matches!(status, OpenStatus::Pending))
            .await
            .map(|status| status.clone())
            .map_err(|_| RealtimeError::ChannelClosed)?;

        match status {
            OpenStatus::Ready(acquired) => Ok(acquired),
            OpenStatus::Failed(e) => Err(e),
            OpenStatus::Pending => Err(RealtimeError::Internal("open still pending".into())),
        }
    }

    async fn open_channel(
        &self,
        key: &ChannelKey,
        scope: &ChannelScope,
        generation: u64,
    ) -> RealtimeResult<Acquired> {
        let handle = match self.transport.open(key).await {
            Ok(handle) => handle,
            Err(e) => {
                let e = match e {
                    RealtimeError::TransportUnavailable(_) => e,
                    other => RealtimeError::TransportUnavailable(other.to_string()),
                };
                self.metrics.increment_open_failures();
                log_event_with_fields(
                    LogEvent::ChannelOpenFailed,
                    &[("channel", key.as_str()), ("error", &e.to_string())],
                );
                self.fail_channel(key, generation, e.clone());
                return Err(e);
            }
        };

        {
            let mut channels = self.channels();
            match channels.get_mut(key).filter(|c| c.generation == generation) {
                Some(channel) => {
                    // Events buffered before the handle was known must
                    // belong to this open
                    channel.inbox.retain(|(handle_id, _)| *handle_id == handle.id);
                    channel.handle = Some(handle.clone());
                }
                None => {
                    drop(channels);
                    self.transport.close(handle);
                    return Err(RealtimeError::ChannelClosed);
                }
            }
        }

        self.metrics.increment_channels_opened();
        log_event_with_fields(
            LogEvent::ChannelOpen,
            &[("channel", key.as_str()), ("handle", &handle.id.to_string())],
        );

        let mut records = None;
        let mut initial = InitialState::Seeded;

        if let ChannelScope::Entity { entity, filter } = scope {
            if let Err(e) = self
                .transport
                .subscribe_changes(&handle, entity, filter.as_ref())
                .await
            {
                let e = RealtimeError::TransportUnavailable(e.to_string());
                self.metrics.increment_open_failures();
                log_event_with_fields(
                    LogEvent::ChannelOpenFailed,
                    &[("channel", key.as_str()), ("error", &e.to_string())],
                );
                self.fail_channel(key, generation, e.clone());
                return Err(e);
            }

            match self.store.fetch_snapshot(entity, filter.as_ref()).await {
                Ok(fetched) => records = Some(fetched),
                Err(e) => {
                    self.metrics.increment_snapshot_failures();
                    log_event_with_fields(
                        LogEvent::SnapshotFailed,
                        &[("channel", key.as_str()), ("error", &e.to_string())],
                    );
                    initial = InitialState::Degraded {
                        reason: e.to_string(),
                    };
                }
            }
        }

        self.finish_open(key, generation, handle, records, initial)
    }

    /// Seed state, publish the outcome to waiters, replay the buffer
    fn finish_open(
        &self,
        key: &ChannelKey,
        generation: u64,
        handle: TransportHandle,
        records: Option<Vec<Value>>,
        mut initial: InitialState,
    ) -> RealtimeResult<Acquired> {
        let acquired = {
            let mut channels = self.channels();
            let Some(channel) = channels.get_mut(key).filter(|c| c.generation == generation) else {
                return Err(RealtimeError::ChannelClosed);
            };

            if let (Some(records), ChannelState::Rows { projection, .. }) =
                (records, &mut channel.state)
            {
                let total = records.len();
                let skipped = projection.apply_initial_snapshot(records);
                log_event_with_fields(
                    LogEvent::SnapshotSeeded,
                    &[
                        ("channel", key.as_str()),
                        ("records", &total.to_string()),
                        ("skipped", &skipped.to_string()),
                    ],
                );
            }

            if channel.overflowed && initial == InitialState::Seeded {
                initial = InitialState::Degraded {
                    reason: "events dropped while opening".to_string(),
                };
            }

            let acquired = Acquired { handle, initial };
            channel.initial = acquired.initial.clone();
            channel.phase = Phase::Dispatching;
            channel.ready.send_replace(OpenStatus::Ready(acquired.clone()));

            if !channel.inbox.is_empty() {
                log_event_with_fields(
                    LogEvent::BufferReplayed,
                    &[("channel", key.as_str()), ("events", &channel.inbox.len().to_string())],
                );
            }
            acquired
        };

        self.drain(key, generation);
        Ok(acquired)
    }

    /// Remove a channel whose open failed and notify its waiters
    fn fail_channel(&self, key: &ChannelKey, generation: u64, error: RealtimeError) {
        let removed = {
            let mut channels = self.channels();
            if channels.get(key).is_some_and(|c| c.generation == generation) {
                channels.remove(key)
            } else {
                None
            }
        };

        if let Some(channel) = removed {
            channel.ready.send_replace(OpenStatus::Failed(error));
            self.teardown(key, channel);
        }
    }

    /// Undo a pending acquire whose future was dropped or failed
    fn abandon(&self, key: &ChannelKey, id: SubscriptionId, opener: Option<u64>) {
        let detached = {
            let mut channels = self.channels();
            let opening_by_us = opener.is_some_and(|generation| {
                channels
                    .get(key)
                    .is_some_and(|c| c.generation == generation && c.phase == Phase::Opening)
            });

            if opening_by_us {
                channels.remove(key).map(Detached::LastOut)
            } else {
                Self::detach(&mut channels, key, id)
            }
        };

        self.finish_detach(key, detached);
    }

    /// Remove a subscriber; no-op for unknown keys or ids
    pub(crate) fn release(&self, key: &ChannelKey, id: SubscriptionId) {
        let detached = Self::detach(&mut self.channels(), key, id);
        if detached.is_some() {
            log_event_with_fields(
                LogEvent::ChannelRelease,
                &[("channel", key.as_str()), ("subscription", &id.to_string())],
            );
        }
        self.finish_detach(key, detached);
    }

    /// The single removal path: deactivate, then zero-check
    fn detach(
        channels: &mut HashMap<ChannelKey, Channel>,
        key: &ChannelKey,
        id: SubscriptionId,
    ) -> Option<Detached> {
        let channel = channels.get_mut(key)?;
        let position = channel.subscribers.iter().position(|s| s.id == id)?;
        let subscriber = channel.subscribers.remove(position);
        subscriber.deactivate();

        if channel.subscribers.is_empty() {
            return channels.remove(key).map(Detached::LastOut);
        }

        // Keep our presence while another local subscriber still tracks it
        let untrack = match (&subscriber.tracks, &channel.handle) {
            (Some(participant), Some(handle))
                if !channel
                    .subscribers
                    .iter()
                    .any(|s| s.tracks.as_ref() == Some(participant)) =>
            {
                Some((handle.clone(), participant.clone()))
            }
            _ => None,
        };
        Some(Detached::Kept { untrack })
    }

    fn finish_detach(&self, key: &ChannelKey, detached: Option<Detached>) {
        match detached {
            Some(Detached::LastOut(channel)) => {
                channel.ready.send_replace(OpenStatus::Failed(RealtimeError::ChannelClosed));
                self.teardown(key, channel);
            }
            Some(Detached::Kept {
                untrack: Some((handle, participant)),
            }) => {
                self.send_logged(&handle, OutboundMessage::Untrack { key: participant });
            }
            Some(Detached::Kept { untrack: None }) | None => {}
        }
    }

    /// Physical teardown of a channel already removed from the map
    fn teardown(&self, key: &ChannelKey, channel: Channel) {
        for subscriber in &channel.subscribers {
            subscriber.deactivate();
        }
        if let ChannelScope::Broadcast { topic } = &channel.scope {
            self.relay.forget(topic);
        }
        if let Some(handle) = channel.handle {
            self.transport.close(handle);
            self.metrics.increment_channels_closed();
            log_event_with_fields(LogEvent::ChannelClose, &[("channel", key.as_str())]);
        }
    }

    /// Queue an inbound event and drain the channel if nobody else is
    pub(crate) fn deliver(&self, handle: &TransportHandle, raw: RawEvent) {
        self.metrics.increment_events_received();
        let key = &handle.key;

        let generation = {
            let mut channels = self.channels();
            let Some(channel) = channels.get_mut(key) else {
                drop(channels);
                self.drop_stale(handle, "no channel");
                return;
            };

            if channel.handle.as_ref().is_some_and(|current| current.id != handle.id) {
                drop(channels);
                self.drop_stale(handle, "replaced handle");
                return;
            }

            if channel.phase == Phase::Opening {
                if channel.inbox.len() >= self.config.max_buffered_events {
                    channel.overflowed = true;
                    self.metrics.increment_events_dropped();
                    log_event_with_fields(
                        LogEvent::BufferOverflow,
                        &[
                            ("channel", key.as_str()),
                            ("limit", &self.config.max_buffered_events.to_string()),
                        ],
                    );
                    return;
                }
                self.metrics.increment_events_buffered();
            }

            channel.inbox.push_back((handle.id, raw));
            if channel.phase != Phase::Idle {
                return;
            }
            channel.phase = Phase::Dispatching;
            channel.generation
        };

        self.drain(key, generation);
    }

    fn drop_stale(&self, handle: &TransportHandle, reason: &str) {
        self.metrics.increment_events_dropped();
        log_event_with_fields(
            LogEvent::StaleEventDropped,
            &[
                ("channel", handle.key.as_str()),
                ("handle", &handle.id.to_string()),
                ("reason", reason),
            ],
        );
    }

    /// Apply and fan out queued events until the inbox is empty
    fn drain(&self, key: &ChannelKey, generation: u64) {
        loop {
            let (events, subscribers) = {
                let mut channels = self.channels();
                let Some(channel) = channels.get_mut(key).filter(|c| c.generation == generation)
                else {
                    return;
                };
                let Some((_, raw)) = channel.inbox.pop_front() else {
                    channel.phase = Phase::Idle;
                    return;
                };

                match channel.state.apply(key, raw, &self.relay) {
                    Ok(events) => (events, channel.subscribers.clone()),
                    Err(e) => {
                        self.metrics.increment_events_dropped();
                        log_event_with_fields(
                            LogEvent::InvalidEvent,
                            &[("channel", key.as_str()), ("error", &e.to_string())],
                        );
                        continue;
                    }
                }
            };

            for event in &events {
                let result = fan_out(key, event, &subscribers, &self.metrics);
                self.metrics.increment_events_dispatched();
                log_event_with_fields(
                    LogEvent::EventDispatched,
                    &[
                        ("channel", key.as_str()),
                        ("event", event.kind().as_str()),
                        ("delivered", &result.delivered.to_string()),
                        ("skipped", &result.skipped.to_string()),
                        ("failed", &result.failed.to_string()),
                    ],
                );
            }
        }
    }

    /// Handle of a live channel
    pub(crate) fn live_handle(&self, key: &ChannelKey) -> Option<TransportHandle> {
        let channels = self.channels();
        channels
            .get(key)
            .filter(|c| c.phase != Phase::Opening)
            .and_then(|c| c.handle.clone())
    }

    /// Send on a channel, logging failures
    pub(crate) fn send_logged(
        &self,
        handle: &TransportHandle,
        message: OutboundMessage,
    ) -> RealtimeResult<()> {
        self.transport.send(handle, message).map_err(|e| {
            log_event_with_fields(
                LogEvent::SendFailed,
                &[("channel", handle.key.as_str()), ("error", &e.to_string())],
            );
            e
        })
    }

    /// Keys of every channel, sorted
    pub fn list_active_channels(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.channels().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Diagnostics for one channel
    pub fn channel_info(&self, key: &ChannelKey) -> Option<ChannelInfo> {
        self.channels().get(key).map(|c| ChannelInfo {
            key: key.clone(),
            phase: c.phase,
            subscribers: c.subscribers.len(),
            buffered: c.inbox.len(),
        })
    }

    /// Cached records of an entity channel
    pub fn records(&self, key: &ChannelKey) -> Option<Vec<Value>> {
        match &self.channels().get(key)?.state {
            ChannelState::Rows { projection, .. } => Some(projection.snapshot()),
            _ => None,
        }
    }

    /// Re-sort an entity channel's display order
    pub fn sort_records<F>(&self, key: &ChannelKey, compare: F) -> bool
    where
        F: FnMut(&Value, &Value) -> std::cmp::Ordering,
    {
        match self.channels().get_mut(key).map(|c| &mut c.state) {
            Some(ChannelState::Rows { projection, .. }) => {
                projection.sort_by(compare);
                true
            }
            _ => false,
        }
    }

    /// Roster of a presence channel
    pub fn roster(&self, key: &ChannelKey) -> Option<BTreeMap<String, PresenceMeta>> {
        match &self.channels().get(key)?.state {
            ChannelState::Presence(tracker) => Some(tracker.roster().clone()),
            _ => None,
        }
    }

    /// Close every channel
    pub fn shutdown_all(&self) {
        log_event(LogEvent::ShutdownStart);

        let channels: Vec<(ChannelKey, Channel)> = self.channels().drain().collect();
        let count = channels.len();
        for (key, channel) in channels {
            channel.ready.send_replace(OpenStatus::Failed(RealtimeError::ChannelClosed));
            self.teardown(&key, channel);
        }

        log_event_with_fields(LogEvent::ShutdownComplete, &[("channels", &count.to_string())]);
    }
}
