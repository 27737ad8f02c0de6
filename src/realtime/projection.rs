//! # Local Projection Cache
//!
//! Materialized view of one entity collection (optionally filtered),
//! seeded by a snapshot and kept current by row changes.
//!
//! Every apply is idempotent: replaying an INSERT or UPDATE that was
//! already applied leaves the cache unchanged, so at-least-once delivery
//! has an at-most-once observable effect.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::channel::ChangeFilter;
use super::errors::{RealtimeError, RealtimeResult};
use super::event::RowChange;

/// Default primary key column
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Identity of a cached record: its primary key as compact JSON, so that
/// `1` and `"1"` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey(String);

impl RecordKey {
    fn of(value: &Value) -> Self {
        RecordKey(value.to_string())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    slot: u64,
    record: Value,
}

/// What an applied change did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    Unchanged,
}

/// Projection of one entity + filter
#[derive(Debug, Clone)]
pub struct Projection {
    primary_key: String,
    filter: Option<ChangeFilter>,
    entries: HashMap<RecordKey, Entry>,
    /// Display order: slot -> key
    order: BTreeMap<u64, RecordKey>,
    next_slot: u64,
}

impl Projection {
    /// Create an empty projection
    pub fn new(primary_key: impl Into<String>, filter: Option<ChangeFilter>) -> Self {
        Self {
            primary_key: primary_key.into(),
            filter,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_slot: 0,
        }
    }

    /// Replace the cache wholesale with a snapshot
    ///
    /// Records without a primary key are skipped; their count is returned.
    pub fn apply_initial_snapshot(&mut self, records: Vec<Value>) -> usize {
        self.entries.clear();
        self.order.clear();
        self.next_slot = 0;

        let mut skipped = 0;
        for record in records {
            match self.key_of(&record) {
                Ok(key) => {
                    self.upsert(key, record);
                }
                Err(_) => skipped += 1,
            }
        }
        skipped
    }

    /// Apply one row change
    ///
    /// INSERT and UPDATE both insert-or-replace by id (an UPDATE for a
    /// missing id heals a missed INSERT). DELETE of a missing id is a no-op.
    pub fn apply_event(&mut self, change: &RowChange) -> RealtimeResult<ApplyOutcome> {
        let key = self.key_of(change.keyed_record())?;

        match change {
            RowChange::Insert { record, .. } | RowChange::Update { record, .. } => {
                if self.filter.as_ref().is_some_and(|f| !f.matches(record)) {
                    return Ok(self.remove(&key));
                }
                Ok(self.upsert(key, record.clone()))
            }
            RowChange::Delete { .. } => Ok(self.remove(&key)),
        }
    }

    /// Current records in display order
    pub fn snapshot(&self) -> Vec<Value> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Look up one record by primary key value
    pub fn get(&self, id: &Value) -> Option<&Value> {
        self.entries.get(&RecordKey::of(id)).map(|entry| &entry.record)
    }

    /// Re-sort the display order; later inserts append after it
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        let mut keys: Vec<RecordKey> = self.order.values().cloned().collect();
        keys.sort_by(|a, b| compare(&self.entries[a].record, &self.entries[b].record));

        self.order.clear();
        for (slot, key) in keys.into_iter().enumerate() {
            let slot = slot as u64;
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.slot = slot;
            }
            self.order.insert(slot, key);
        }
        self.next_slot = self.order.len() as u64;
    }

    /// Number of cached records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_of(&self, record: &Value) -> RealtimeResult<RecordKey> {
        record
            .get(&self.primary_key)
            .filter(|id| !id.is_null())
            .map(RecordKey::of)
            .ok_or_else(|| {
                RealtimeError::InvalidMessage(format!(
                    "record has no '{}' primary key",
                    self.primary_key
                ))
            })
    }

    fn upsert(&mut self, key: RecordKey, record: Value) -> ApplyOutcome {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.record == record {
                return ApplyOutcome::Unchanged;
            }
            entry.record = record;
            return ApplyOutcome::Replaced;
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        self.order.insert(slot, key.clone());
        self.entries.insert(key, Entry { slot, record });
        ApplyOutcome::Inserted
    }

    fn remove(&mut self, key: &RecordKey) -> ApplyOutcome {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.slot);
                ApplyOutcome::Removed
            }
            None => ApplyOutcome::Unchanged,
        }
    }
}
