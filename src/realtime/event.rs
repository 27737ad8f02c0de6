//! # Real-Time Events
//!
//! Typed events observed by subscribers, and the raw wire events the
//! transport delivers before classification.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};
use super::presence::PresenceMeta;

/// Type of row change on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// New record inserted
    Insert,
    /// Existing record updated
    Update,
    /// Record deleted
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// Kind of subscription / event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RowChange,
    Presence,
    Broadcast,
}

impl EventKind {
    /// Name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RowChange => "row_change",
            EventKind::Presence => "presence",
            EventKind::Broadcast => "broadcast",
        }
    }
}

/// Row change applied to a projection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "UPPERCASE")]
pub enum RowChange {
    Insert {
        entity: String,
        record: Value,
    },
    Update {
        entity: String,
        record: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        old: Option<Value>,
    },
    Delete {
        entity: String,
        old: Value,
    },
}

impl RowChange {
    /// Wire event type
    pub fn event_type(&self) -> EventType {
        match self {
            RowChange::Insert { .. } => EventType::Insert,
            RowChange::Update { .. } => EventType::Update,
            RowChange::Delete { .. } => EventType::Delete,
        }
    }

    /// Entity the change belongs to
    pub fn entity(&self) -> &str {
        match self {
            RowChange::Insert { entity, .. }
            | RowChange::Update { entity, .. }
            | RowChange::Delete { entity, .. } => entity,
        }
    }

    /// The record carrying the primary key for this change
    pub fn keyed_record(&self) -> &Value {
        match self {
            RowChange::Insert { record, .. } | RowChange::Update { record, .. } => record,
            RowChange::Delete { old, .. } => old,
        }
    }
}

/// Presence change in a room
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PresenceDelta {
    Join {
        room: String,
        key: String,
        meta: PresenceMeta,
    },
    Leave {
        room: String,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<PresenceMeta>,
    },
}

impl PresenceDelta {
    /// Participant key
    pub fn key(&self) -> &str {
        match self {
            PresenceDelta::Join { key, .. } | PresenceDelta::Leave { key, .. } => key,
        }
    }

    /// Whether this is a join
    pub fn is_join(&self) -> bool {
        matches!(self, PresenceDelta::Join { .. })
    }
}

/// Broadcast message relayed to subscribers; never cached
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastMessage {
    /// Topic name
    pub topic: String,

    /// Event name (user-defined)
    pub event: String,

    /// Payload
    pub payload: Value,

    /// When the message reached this process
    pub received_at: DateTime<Utc>,
}

/// Typed event delivered to subscriber callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Event {
    Row(RowChange),
    Presence(PresenceDelta),
    Broadcast(BroadcastMessage),
}

impl Event {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Row(_) => EventKind::RowChange,
            Event::Presence(_) => EventKind::Presence,
            Event::Broadcast(_) => EventKind::Broadcast,
        }
    }
}

/// Payload of a row change on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// Change type
    pub event: EventType,

    /// Entity (table) name
    pub table: String,

    /// New record (INSERT/UPDATE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,

    /// Old record (UPDATE/DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl ChangePayload {
    /// Convert to a typed row change
    pub fn into_row_change(self) -> RealtimeResult<RowChange> {
        let missing = |which: &str| {
            RealtimeError::InvalidMessage(format!(
                "{} on '{}' without '{}' record",
                self.event, self.table, which
            ))
        };

        match self.event {
            EventType::Insert => {
                let record = self.new.clone().ok_or_else(|| missing("new"))?;
                Ok(RowChange::Insert {
                    entity: self.table,
                    record,
                })
            }
            EventType::Update => {
                let record = self.new.clone().ok_or_else(|| missing("new"))?;
                Ok(RowChange::Update {
                    entity: self.table,
                    record,
                    old: self.old,
                })
            }
            EventType::Delete => {
                let old = self.old.clone().ok_or_else(|| missing("old"))?;
                Ok(RowChange::Delete {
                    entity: self.table,
                    old,
                })
            }
        }
    }
}

/// Inbound wire event, before classification against its channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEvent {
    /// Row change
    PostgresChanges { payload: ChangePayload },

    /// Incremental presence joins and leaves
    PresenceDiff {
        #[serde(default)]
        joins: BTreeMap<String, PresenceMeta>,
        #[serde(default)]
        leaves: BTreeMap<String, PresenceMeta>,
    },

    /// Full presence state for reconciliation
    PresenceState { state: BTreeMap<String, PresenceMeta> },

    /// User broadcast
    Broadcast {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl RawEvent {
    /// Parse a raw event from JSON text
    pub fn from_json(text: &str) -> RealtimeResult<Self> {
        serde_json::from_str(text).map_err(|e| RealtimeError::InvalidMessage(e.to_string()))
    }

    /// Which subscription kind this event belongs to
    pub fn kind(&self) -> EventKind {
        match self {
            RawEvent::PostgresChanges { .. } => EventKind::RowChange,
            RawEvent::PresenceDiff { .. } | RawEvent::PresenceState { .. } => EventKind::Presence,
            RawEvent::Broadcast { .. } => EventKind::Broadcast,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            RawEvent::PostgresChanges { .. } => "postgres_changes",
            RawEvent::PresenceDiff { .. } => "presence_diff",
            RawEvent::PresenceState { .. } => "presence_state",
            RawEvent::Broadcast { .. } => "broadcast",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Insert.to_string(), "INSERT");
        assert_eq!(EventType::Update.to_string(), "UPDATE");
        assert_eq!(EventType::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_parse_row_change() {
        let raw = RawEvent::from_json(
            r#"{"type":"postgres_changes","payload":{"event":"INSERT","table":"clients","new":{"id":2,"name":"B"}}}"#,
        )
        .unwrap();
        assert_eq!(raw.kind(), EventKind::RowChange);

        let RawEvent::PostgresChanges { payload } = raw else {
            panic!("wrong variant");
        };
        let change = payload.into_row_change().unwrap();
        assert_eq!(change.event_type(), EventType::Insert);
        assert_eq!(change.entity(), "clients");
        assert_eq!(change.keyed_record()["id"], 2);
    }

    #[test]
    fn test_delete_without_old_is_invalid() {
        let payload = ChangePayload {
            event: EventType::Delete,
            table: "clients".to_string(),
            new: None,
            old: None,
        };
        assert!(matches!(
            payload.into_row_change(),
            Err(RealtimeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_presence_and_broadcast() {
        let raw = RawEvent::from_json(
            r#"{"type":"presence_diff","joins":{"u1":{"name":"Ann","joined_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();
        match raw {
            RawEvent::PresenceDiff { joins, leaves } => {
                assert_eq!(joins.len(), 1);
                assert!(leaves.is_empty());
                assert_eq!(joins["u1"].name.as_deref(), Some("Ann"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let raw = RawEvent::from_json(r#"{"type":"broadcast","event":"cursor","payload":{"x":1}}"#).unwrap();
        assert_eq!(raw.kind(), EventKind::Broadcast);
        assert_eq!(raw.name(), "broadcast");
    }

    #[test]
    fn test_malformed_raw_event() {
        assert!(matches!(
            RawEvent::from_json(r#"{"type":"nope"}"#),
            Err(RealtimeError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_event_serializes_with_kind() {
        let event = Event::Row(RowChange::Insert {
            entity: "clients".to_string(),
            record: json!({"id": 1}),
        });
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["kind"], "row");
        assert_eq!(wire["data"]["event"], "INSERT");
        assert_eq!(event.kind(), EventKind::RowChange);
    }
}
