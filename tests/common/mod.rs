//! Shared fixtures for realtime integration tests
//!
//! In-memory transport and snapshot store. Both can be gated so a test
//! can act while an open or a snapshot fetch is in flight.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use aerosync::realtime::{
    ChangeFilter, ChangePayload, ChannelKey, EventType, OutboundMessage, PresenceMeta, RawEvent,
    Realtime, RealtimeConfig, RealtimeError, RealtimeResult, SnapshotStore, Transport,
    TransportHandle,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};

// =============================================================================
// Gate
// =============================================================================

/// Holds async operations until opened
pub struct Gate {
    open: watch::Sender<bool>,
    entered: Notify,
}

impl Gate {
    fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self {
            open: tx,
            entered: Notify::new(),
        }
    }

    async fn pass(&self) {
        self.entered.notify_one();
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait until an operation reached the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }
}

// =============================================================================
// Mock Transport
// =============================================================================

pub struct MockTransport {
    next_id: AtomicU64,
    pub gate: Gate,
    failures: Mutex<VecDeque<RealtimeError>>,
    pub opened: Mutex<Vec<TransportHandle>>,
    pub closed: Mutex<Vec<TransportHandle>>,
    pub sent: Mutex<Vec<(ChannelKey, OutboundMessage)>>,
    pub change_requests: Mutex<Vec<(String, Option<ChangeFilter>)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_gate(true))
    }

    /// Opens block until `gate.release()`
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::with_gate(false))
    }

    fn with_gate(open: bool) -> Self {
        Self {
            next_id: AtomicU64::new(100),
            gate: Gate::new(open),
            failures: Mutex::new(VecDeque::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            change_requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next open with `error`
    pub fn fail_next_open(&self, error: RealtimeError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }

    /// Most recent handle opened for `key`
    pub fn handle_for(&self, key: &ChannelKey) -> TransportHandle {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|h| &h.key == key)
            .cloned()
            .expect("channel was never opened")
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, key: &ChannelKey) -> RealtimeResult<TransportHandle> {
        let handle = TransportHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            key: key.clone(),
        };
        // Recorded before the gate so tests can deliver early events
        self.opened.lock().unwrap().push(handle.clone());

        self.gate.pass().await;

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(e) => Err(e),
            None => Ok(handle),
        }
    }

    async fn subscribe_changes(
        &self,
        _handle: &TransportHandle,
        entity: &str,
        filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<()> {
        self.change_requests
            .lock()
            .unwrap()
            .push((entity.to_string(), filter.cloned()));
        Ok(())
    }

    fn send(&self, handle: &TransportHandle, message: OutboundMessage) -> RealtimeResult<()> {
        self.sent.lock().unwrap().push((handle.key.clone(), message));
        Ok(())
    }

    fn close(&self, handle: TransportHandle) {
        self.closed.lock().unwrap().push(handle);
    }
}

// =============================================================================
// Mock Store
// =============================================================================

pub struct MockStore {
    pub gate: Gate,
    records: Mutex<Vec<Value>>,
    failure: Mutex<Option<RealtimeError>>,
    pub fetches: AtomicU64,
}

impl MockStore {
    pub fn with_records(records: Vec<Value>) -> Arc<Self> {
        Arc::new(Self::build(records, true))
    }

    /// Fetches block until `gate.release()`
    pub fn gated(records: Vec<Value>) -> Arc<Self> {
        Arc::new(Self::build(records, false))
    }

    fn build(records: Vec<Value>, open: bool) -> Self {
        Self {
            gate: Gate::new(open),
            records: Mutex::new(records),
            failure: Mutex::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn fail_with(&self, error: RealtimeError) {
        *self.failure.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl SnapshotStore for MockStore {
    async fn fetch_snapshot(
        &self,
        _entity: &str,
        _filter: Option<&ChangeFilter>,
    ) -> RealtimeResult<Vec<Value>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;

        let failure = self.failure.lock().unwrap().clone();
        match failure {
            Some(e) => Err(e),
            None => Ok(self.records.lock().unwrap().clone()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn realtime(transport: &Arc<MockTransport>, store: &Arc<MockStore>) -> Realtime {
    realtime_with(RealtimeConfig::default(), transport, store)
}

pub fn realtime_with(
    mut config: RealtimeConfig,
    transport: &Arc<MockTransport>,
    store: &Arc<MockStore>,
) -> Realtime {
    config.participant_key.get_or_insert_with(|| "me".to_string());
    Realtime::new(config, transport.clone(), store.clone()).unwrap()
}

/// Yield until `check` holds
pub async fn until(mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

fn change(event: EventType, table: &str, new: Option<Value>, old: Option<Value>) -> RawEvent {
    RawEvent::PostgresChanges {
        payload: ChangePayload {
            event,
            table: table.to_string(),
            new,
            old,
        },
    }
}

pub fn insert(table: &str, record: Value) -> RawEvent {
    change(EventType::Insert, table, Some(record), None)
}

pub fn update(table: &str, record: Value) -> RawEvent {
    change(EventType::Update, table, Some(record), None)
}

pub fn delete(table: &str, id: i64) -> RawEvent {
    change(EventType::Delete, table, None, Some(json!({ "id": id })))
}

pub fn broadcast(event: &str, payload: Value) -> RawEvent {
    RawEvent::Broadcast {
        event: event.to_string(),
        payload,
    }
}

pub fn joins(keys: &[&str]) -> RawEvent {
    RawEvent::PresenceDiff {
        joins: keys
            .iter()
            .map(|k| (k.to_string(), PresenceMeta::new(*k)))
            .collect(),
        leaves: Default::default(),
    }
}

pub fn leaves(keys: &[&str]) -> RawEvent {
    RawEvent::PresenceDiff {
        joins: Default::default(),
        leaves: keys
            .iter()
            .map(|k| (k.to_string(), PresenceMeta::new(*k)))
            .collect(),
    }
}

pub fn full_state(keys: &[&str]) -> RawEvent {
    RawEvent::PresenceState {
        state: keys
            .iter()
            .map(|k| (k.to_string(), PresenceMeta::new(*k)))
            .collect(),
    }
}
