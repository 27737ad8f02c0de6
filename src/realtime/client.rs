//! # Realtime Client
//!
//! Composition root of the realtime layer. A `Realtime` is constructed
//! explicitly from a config, a transport and a snapshot store, and is a
//! cheap cloneable handle over one shared registry.
//!
//! ```ignore
//! let (transport, inbound) = WebSocketTransport::connect(&config.websocket).await?;
//! let realtime = Realtime::new(config, Arc::new(transport), Arc::new(EmptySnapshotStore))?;
//! tokio::spawn({
//!     let realtime = realtime.clone();
//!     async move { realtime.run(inbound).await }
//! });
//!
//! let sub = realtime
//!     .subscribe_to_entity("clients", None, |change| {
//!         println!("{:?}", change);
//!         Ok(())
//!     })
//!     .await?;
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::channel::{ChangeFilter, ChannelKey, ChannelScope};
use super::config::RealtimeConfig;
use super::errors::{RealtimeError, RealtimeResult};
use super::event::{BroadcastMessage, Event, EventKind, PresenceDelta, RawEvent, RowChange};
use super::presence::PresenceMeta;
use super::registry::{ChannelInfo, ChannelRegistry};
use super::subscription::{callback, Callback, CallbackResult, Subscriber, Subscription};
use super::transport::{Inbound, OutboundMessage, SnapshotStore, Transport, TransportHandle};
use crate::observability::{log_event_with_fields, Event as LogEvent, MetricsSnapshot};

/// Handle to the realtime layer
#[derive(Clone)]
pub struct Realtime {
    registry: Arc<ChannelRegistry>,
    participant_key: String,
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("participant_key", &self.participant_key)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Realtime {
    /// Create a realtime layer over `transport` and `store`
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SnapshotStore>,
    ) -> RealtimeResult<Self> {
        config.validate()?;
        let participant_key = config
            .participant_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            registry: Arc::new(ChannelRegistry::new(config, transport, store)),
            participant_key,
        })
    }

    /// Own presence key
    pub fn participant_key(&self) -> &str {
        &self.participant_key
    }

    /// Active configuration
    pub fn config(&self) -> &RealtimeConfig {
        self.registry.config()
    }

    /// Current counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.registry.metrics().snapshot()
    }

    async fn register(
        &self,
        scope: ChannelScope,
        kind: EventKind,
        tracks: Option<String>,
        callback: Callback,
    ) -> RealtimeResult<(Subscription, TransportHandle)> {
        let key = scope.key();
        let id = self.registry.next_subscription_id();
        let subscriber = Arc::new(Subscriber::new(id, kind, tracks, callback));

        let acquired = self.registry.acquire(scope, subscriber).await?;
        let subscription = Subscription::new(
            id,
            key,
            kind,
            acquired.initial,
            Arc::downgrade(&self.registry),
        );
        Ok((subscription, acquired.handle))
    }

    /// Live row changes of `entity`, optionally filtered
    ///
    /// The channel's cache is seeded from the store before the first
    /// change is delivered. A failed snapshot still returns a subscription,
    /// marked degraded.
    pub async fn subscribe_to_entity<F>(
        &self,
        entity: &str,
        filter: Option<ChangeFilter>,
        on_change: F,
    ) -> RealtimeResult<Subscription>
    where
        F: Fn(&RowChange) -> CallbackResult + Send + Sync + 'static,
    {
        let scope = ChannelKey::entity_scope(entity, filter.as_ref())?;
        let (subscription, _) = self
            .register(
                scope,
                EventKind::RowChange,
                None,
                callback(move |event| match event {
                    Event::Row(change) => on_change(change),
                    _ => Ok(()),
                }),
            )
            .await?;
        Ok(subscription)
    }

    /// Join `room` as this participant and watch its roster
    ///
    /// Own presence is tracked with `self_meta` and untracked when the
    /// last local subscription tracking it is released.
    pub async fn subscribe_to_presence<J, L>(
        &self,
        room: &str,
        self_meta: PresenceMeta,
        on_join: J,
        on_leave: L,
    ) -> RealtimeResult<Subscription>
    where
        J: Fn(&str, &PresenceMeta) -> CallbackResult + Send + Sync + 'static,
        L: Fn(&str, Option<&PresenceMeta>) -> CallbackResult + Send + Sync + 'static,
    {
        ChannelKey::presence(room)?;
        let scope = ChannelScope::Presence {
            room: room.to_string(),
        };

        let (subscription, handle) = self
            .register(
                scope,
                EventKind::Presence,
                Some(self.participant_key.clone()),
                presence_callback(on_join, on_leave),
            )
            .await?;

        let track = OutboundMessage::Track {
            key: self.participant_key.clone(),
            meta: self_meta,
        };
        // On failure the subscription is dropped, which releases it
        self.registry.send_logged(&handle, track)?;
        Ok(subscription)
    }

    /// Watch `room` without tracking own presence
    pub async fn watch_presence<J, L>(
        &self,
        room: &str,
        on_join: J,
        on_leave: L,
    ) -> RealtimeResult<Subscription>
    where
        J: Fn(&str, &PresenceMeta) -> CallbackResult + Send + Sync + 'static,
        L: Fn(&str, Option<&PresenceMeta>) -> CallbackResult + Send + Sync + 'static,
    {
        ChannelKey::presence(room)?;
        let scope = ChannelScope::Presence {
            room: room.to_string(),
        };
        let (subscription, _) = self
            .register(scope, EventKind::Presence, None, presence_callback(on_join, on_leave))
            .await?;
        Ok(subscription)
    }

    /// Messages broadcast on `topic`
    pub async fn subscribe_to_broadcast<F>(
        &self,
        topic: &str,
        on_message: F,
    ) -> RealtimeResult<Subscription>
    where
        F: Fn(&BroadcastMessage) -> CallbackResult + Send + Sync + 'static,
    {
        ChannelKey::broadcast(topic)?;
        let scope = ChannelScope::Broadcast {
            topic: topic.to_string(),
        };
        let (subscription, _) = self
            .register(
                scope,
                EventKind::Broadcast,
                None,
                callback(move |event| match event {
                    Event::Broadcast(message) => on_message(message),
                    _ => Ok(()),
                }),
            )
            .await?;
        Ok(subscription)
    }

    /// Send a message on `topic`; fire-and-forget
    ///
    /// Requires a live subscription on the topic. Size and rate limits
    /// apply per topic.
    pub fn broadcast(&self, topic: &str, event: &str, payload: Value) -> RealtimeResult<()> {
        let key = ChannelKey::broadcast(topic)?;
        let handle = self
            .registry
            .live_handle(&key)
            .ok_or_else(|| RealtimeError::ChannelNotFound(key.to_string()))?;

        self.registry.relay().admit(topic, &payload)?;
        self.registry.send_logged(
            &handle,
            OutboundMessage::Broadcast {
                event: event.to_string(),
                payload,
            },
        )?;

        self.registry.metrics().increment_broadcasts_sent();
        log_event_with_fields(
            LogEvent::BroadcastSent,
            &[("channel", key.as_str()), ("event", event)],
        );
        Ok(())
    }

    /// Release a subscription
    pub fn unsubscribe(&self, subscription: Subscription) {
        subscription.release();
    }

    /// Keys of every open or opening channel, sorted
    pub fn list_active_channels(&self) -> Vec<ChannelKey> {
        self.registry.list_active_channels()
    }

    /// Diagnostics for one channel
    pub fn channel_info(&self, key: &ChannelKey) -> Option<ChannelInfo> {
        self.registry.channel_info(key)
    }

    /// Cached records of an entity channel, in display order
    pub fn records(&self, key: &ChannelKey) -> Option<Vec<Value>> {
        self.registry.records(key)
    }

    /// Re-sort an entity channel's display order; false if not an entity channel
    pub fn sort_records<F>(&self, key: &ChannelKey, compare: F) -> bool
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.registry.sort_records(key, compare)
    }

    /// Roster of a presence channel
    pub fn roster(&self, key: &ChannelKey) -> Option<BTreeMap<String, PresenceMeta>> {
        self.registry.roster(key)
    }

    /// Close every channel
    pub fn shutdown_all(&self) {
        self.registry.shutdown_all();
    }

    /// Deliver one inbound event from the transport
    pub fn on_transport_event(&self, handle: &TransportHandle, raw: RawEvent) {
        self.registry.deliver(handle, raw);
    }

    /// Deliver inbound events until the transport closes the stream
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(Inbound { handle, event }) = inbound.recv().await {
            self.on_transport_event(&handle, event);
        }
    }
}

fn presence_callback<J, L>(on_join: J, on_leave: L) -> Callback
where
    J: Fn(&str, &PresenceMeta) -> CallbackResult + Send + Sync + 'static,
    L: Fn(&str, Option<&PresenceMeta>) -> CallbackResult + Send + Sync + 'static,
{
    callback(move |event| match event {
        Event::Presence(PresenceDelta::Join { key, meta, .. }) => on_join(key, meta),
        Event::Presence(PresenceDelta::Leave { key, meta, .. }) => on_leave(key, meta.as_ref()),
        _ => Ok(()),
    })
}
