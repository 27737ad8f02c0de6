//! # Presence Tracking
//!
//! Per-room roster of online participants, derived from join/leave deltas
//! and healed by full-state reconciliation.
//!
//! Deltas are eventually consistent. A reconcile always wins: afterwards
//! the roster equals the pushed state exactly, and the difference is
//! reported as ordinary join/leave deltas.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::PresenceDelta;

/// Participant metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Role in the room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// When the participant joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,

    /// Write timestamp used for last-write-wins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Custom state
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PresenceMeta {
    /// Metadata stamped with the current time
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: Some(name.into()),
            role: None,
            joined_at: Some(now),
            updated_at: Some(now),
            extra: Map::new(),
        }
    }

    /// Set the role
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Add a custom field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// True when name, role and custom state match; timestamps are ignored
    pub fn same_payload(&self, other: &PresenceMeta) -> bool {
        self.name == other.name && self.role == other.role && self.extra == other.extra
    }

    /// True when `self` carries a write timestamp later than `other`'s
    ///
    /// Entries without `updated_at` never win or lose on time.
    fn written_after(&self, other: &PresenceMeta) -> bool {
        match (self.updated_at, other.updated_at) {
            (Some(mine), Some(theirs)) => mine > theirs,
            _ => false,
        }
    }
}

/// Presence roster for one room
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    /// Room name
    pub room: String,

    /// Participants by key
    roster: BTreeMap<String, PresenceMeta>,
}

impl PresenceTracker {
    /// Create an empty tracker
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            roster: BTreeMap::new(),
        }
    }

    /// Upsert a participant
    ///
    /// Returns `None` when the stored entry was written later than `meta`.
    pub fn join(&mut self, key: &str, meta: PresenceMeta) -> Option<PresenceDelta> {
        if let Some(existing) = self.roster.get(key) {
            if existing.written_after(&meta) {
                return None;
            }
        }

        self.roster.insert(key.to_string(), meta.clone());
        Some(PresenceDelta::Join {
            room: self.room.clone(),
            key: key.to_string(),
            meta,
        })
    }

    /// Remove a participant; `None` if it was not present
    pub fn leave(&mut self, key: &str) -> Option<PresenceDelta> {
        self.roster.remove(key).map(|meta| PresenceDelta::Leave {
            room: self.room.clone(),
            key: key.to_string(),
            meta: Some(meta),
        })
    }

    /// Replace the roster wholesale, returning the synthetic deltas
    ///
    /// Leaves come first, then joins for new entries and entries whose
    /// payload changed.
    pub fn reconcile(&mut self, full: BTreeMap<String, PresenceMeta>) -> Vec<PresenceDelta> {
        let mut deltas = Vec::new();

        for (key, meta) in &self.roster {
            if !full.contains_key(key) {
                deltas.push(PresenceDelta::Leave {
                    room: self.room.clone(),
                    key: key.clone(),
                    meta: Some(meta.clone()),
                });
            }
        }

        for (key, meta) in &full {
            let unchanged = self
                .roster
                .get(key)
                .is_some_and(|existing| existing.same_payload(meta));
            if !unchanged {
                deltas.push(PresenceDelta::Join {
                    room: self.room.clone(),
                    key: key.clone(),
                    meta: meta.clone(),
                });
            }
        }

        self.roster = full;
        deltas
    }

    /// Current roster
    pub fn roster(&self) -> &BTreeMap<String, PresenceMeta> {
        &self.roster
    }

    /// Metadata for one participant
    pub fn get(&self, key: &str) -> Option<&PresenceMeta> {
        self.roster.get(key)
    }

    /// Number of participants online
    pub fn count(&self) -> usize {
        self.roster.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn meta(name: &str) -> PresenceMeta {
        PresenceMeta::new(name)
    }

    #[test]
    fn test_join_leave() {
        let mut tracker = PresenceTracker::new("dashboard");

        assert!(tracker.join("u1", meta("Ann")).unwrap().is_join());
        tracker.join("u2", meta("Bob"));
        let delta = tracker.leave("u1").unwrap();

        assert!(!delta.is_join());
        assert_eq!(delta.key(), "u1");
        assert_eq!(tracker.count(), 1);
        assert!(tracker.get("u2").is_some());
    }

    #[test]
    fn test_leave_unknown_is_silent() {
        let mut tracker = PresenceTracker::new("dashboard");
        assert!(tracker.leave("ghost").is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let mut tracker = PresenceTracker::new("dashboard");
        let newer = meta("Ann").with_role("admin");
        let mut older = meta("Ann").with_role("viewer");
        older.updated_at = newer.updated_at.map(|t| t - Duration::seconds(5));

        tracker.join("u1", newer);
        assert!(tracker.join("u1", older).is_none());
        assert_eq!(tracker.get("u1").unwrap().role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_reconcile_converges_and_reports_diff() {
        let mut tracker = PresenceTracker::new("dashboard");
        tracker.join("u1", meta("Ann"));
        tracker.join("u2", meta("Bob"));
        tracker.leave("u1");

        let mut full = BTreeMap::new();
        full.insert("u3".to_string(), meta("Cy"));

        let deltas = tracker.reconcile(full.clone());

        assert_eq!(tracker.roster(), &full);
        assert_eq!(deltas.len(), 2);
        assert!(!deltas[0].is_join());
        assert_eq!(deltas[0].key(), "u2");
        assert!(deltas[1].is_join());
        assert_eq!(deltas[1].key(), "u3");
    }

    #[test]
    fn test_reconcile_unchanged_entry_is_quiet() {
        let mut tracker = PresenceTracker::new("dashboard");
        let ann = meta("Ann");
        tracker.join("u1", ann.clone());

        let mut full = BTreeMap::new();
        full.insert("u1".to_string(), ann);
        assert!(tracker.reconcile(full).is_empty());
    }

    #[test]
    fn test_untimed_update_does_not_lose_to_timestamp() {
        let mut tracker = PresenceTracker::new("dashboard");
        tracker.join("u1", meta("Ann").with_role("viewer"));

        let untimed: PresenceMeta =
            serde_json::from_value(json!({"name": "Ann", "role": "admin"})).unwrap();
        assert!(untimed.updated_at.is_none());

        assert!(tracker.join("u1", untimed).is_some());
        assert_eq!(tracker.get("u1").unwrap().role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_reconcile_ignores_timestamps() {
        let mut tracker = PresenceTracker::new("dashboard");
        tracker.join("u1", meta("Ann"));

        let mut restamped = meta("Ann");
        restamped.joined_at = None;
        restamped.updated_at = restamped.updated_at.map(|t| t + Duration::seconds(30));

        let mut full = BTreeMap::new();
        full.insert("u1".to_string(), restamped.clone());
        assert!(tracker.reconcile(full.clone()).is_empty());
        assert_eq!(tracker.roster(), &full);

        let mut changed = BTreeMap::new();
        changed.insert("u1".to_string(), restamped.with_field("status", json!("away")));
        let deltas = tracker.reconcile(changed);
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].is_join());
    }

    #[test]
    fn test_meta_without_timestamps_stays_untimed() {
        let meta: PresenceMeta = serde_json::from_value(json!({"name": "Ann"})).unwrap();
        assert!(meta.joined_at.is_none());
        assert!(meta.updated_at.is_none());

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value, json!({"name": "Ann"}));
    }

    #[test]
    fn test_meta_extra_fields_roundtrip() {
        let meta = meta("Ann").with_field("status", json!("busy"));
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["status"], "busy");

        let back: PresenceMeta = serde_json::from_value(value).unwrap();
        assert_eq!(back.extra["status"], "busy");
    }
}
