//! # Transport and Store Boundaries
//!
//! The realtime layer consumes two collaborators: a transport that opens
//! channels and delivers inbound events, and a store that answers the
//! one-off snapshot query made when a row-change channel opens.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::channel::{ChangeFilter, ChannelKey};
use super::errors::RealtimeResult;
use super::event::RawEvent;
use super::presence::PresenceMeta;

/// One physical transport channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle {
    /// Unique per open
    pub id: u64,
    /// Channel the handle was opened for
    pub key: ChannelKey,
}

/// Message sent over an open channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// User broadcast
    Broadcast { event: String, payload: Value },
    /// Start tracking own presence
    Track { key: String, meta: PresenceMeta },
    /// Stop tracking own presence
    Untrack { key: String },
}

/// Inbound event tagged with the handle it arrived on
#[derive(Debug, Clone)]
pub struct Inbound {
    pub handle: TransportHandle,
    pub event: RawEvent,
}

/// Transport that carries channels
///
/// `send` and `close` never block: close is fire-and-forget, and the
/// releasing caller never waits for physical teardown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel; fails with `TransportUnavailable`
    async fn open(&self, key: &ChannelKey) -> RealtimeResult<TransportHandle>;

    /// Ask for row changes of an entity on an open channel
    async fn subscribe_changes(
        &self,
        handle: &TransportHandle,
        entity: &str,
        filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<()>;

    /// Send a message on an open channel
    fn send(&self, handle: &TransportHandle, message: OutboundMessage) -> RealtimeResult<()>;

    /// Close a channel
    fn close(&self, handle: TransportHandle);
}

/// Store queried for the initial snapshot of an entity
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Current records of `entity` matching `filter`
    async fn fetch_snapshot(
        &self,
        entity: &str,
        filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<Vec<Value>>;
}

/// Store for consumers without a query interface: every cache starts
/// empty and fills from live inserts.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySnapshotStore;

#[async_trait]
impl SnapshotStore for EmptySnapshotStore {
    async fn fetch_snapshot(
        &self,
        _entity: &str,
        _filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<Vec<Value>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_store() {
        let records = EmptySnapshotStore.fetch_snapshot("clients", None).await.unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_outbound_serialize() {
        let msg = OutboundMessage::Untrack {
            key: "u1".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "untrack");
        assert_eq!(json["key"], "u1");
    }
}
