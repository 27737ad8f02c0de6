//! # Realtime Synchronization Layer
//!
//! Keeps many independent local viewers consistent with a remote store by
//! multiplexing row changes, presence and broadcast messages over a small
//! number of deduplicated channels.
//!
//! ## Architecture
//!
//! - **Transport** (boundary): opens channels, carries inbound events
//! - **Registry**: one live channel per key, subscriber list as refcount
//! - **Dispatcher**: classifies raw events, ordered and isolated fan-out
//! - **Projection**: per-entity record cache seeded by a snapshot
//! - **Presence**: per-room roster with full-state reconciliation
//! - **Broadcast**: pass-through messaging with per-topic limits
//! - **Client**: public API and composition root
//! - **WebSocket**: transport over a single WebSocket connection

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod event;
pub mod presence;
pub mod projection;
pub mod registry;
pub mod subscription;
pub mod transport;
pub mod websocket;

pub use broadcast::{BroadcastConfig, BroadcastRelay};
pub use channel::{ChangeFilter, ChannelKey, ChannelScope, FilterOp};
pub use client::Realtime;
pub use config::RealtimeConfig;
pub use errors::{RealtimeError, RealtimeResult};
pub use event::{
    BroadcastMessage, ChangePayload, Event, EventKind, EventType, PresenceDelta, RawEvent,
    RowChange,
};
pub use presence::{PresenceMeta, PresenceTracker};
pub use projection::{ApplyOutcome, Projection, RecordKey};
pub use registry::{ChannelInfo, ChannelRegistry, Phase};
pub use subscription::{CallbackError, CallbackResult, InitialState, Subscription, SubscriptionId};
pub use transport::{
    EmptySnapshotStore, Inbound, OutboundMessage, SnapshotStore, Transport, TransportHandle,
};
pub use websocket::{ClientFrame, ServerFrame, WebSocketConfig, WebSocketTransport};
