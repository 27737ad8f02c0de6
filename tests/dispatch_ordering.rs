//! Event Dispatch Ordering Tests
//!
//! - Events on a channel are observed by every subscriber in arrival order
//! - Events arriving while a channel opens are buffered and replayed after
//!   the snapshot
//! - Re-entrant release and delivery from inside a callback
//! - Callback failures are isolated

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aerosync::realtime::{
    ChannelKey, InitialState, Phase, RealtimeConfig, RealtimeError, RowChange, Subscription,
};
use common::{
    broadcast, delete, insert, realtime, realtime_with, update, MockStore, MockTransport,
};
use serde_json::{json, Value};

type Log = Arc<Mutex<Vec<String>>>;

fn row_label(change: &RowChange) -> String {
    format!("{}:{}", change.event_type(), change.keyed_record()["id"])
}

// =============================================================================
// Ordering
// =============================================================================

/// Every subscriber observes E1 before E2, subscribers in registration order.
#[tokio::test]
async fn test_fan_out_order() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![]);
    let rt = realtime(&transport, &store);
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let mut subs = Vec::new();
    for name in ["a", "b"] {
        let log = Arc::clone(&log);
        subs.push(
            rt.subscribe_to_broadcast("chat", move |message| {
                log.lock().unwrap().push(format!("{}:{}", name, message.event));
                Ok(())
            })
            .await
            .unwrap(),
        );
    }

    let handle = transport.handle_for(subs[0].key());
    rt.on_transport_event(&handle, broadcast("e1", json!({})));
    rt.on_transport_event(&handle, broadcast("e2", json!({})));

    assert_eq!(*log.lock().unwrap(), vec!["a:e1", "b:e1", "a:e2", "b:e2"]);

    let metrics = rt.metrics();
    assert_eq!(metrics.events_dispatched, 2);
    assert_eq!(metrics.deliveries, 4);
}

/// Update and delete of one key apply strictly in arrival order.
#[tokio::test]
async fn test_update_then_delete_last_applied_wins() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![json!({"id": 1, "name": "A"})]);
    let rt = realtime(&transport, &store);

    let sub = rt.subscribe_to_entity("clients", None, |_| Ok(())).await.unwrap();
    let handle = transport.handle_for(sub.key());

    rt.on_transport_event(&handle, update("clients", json!({"id": 1, "name": "A2"})));
    rt.on_transport_event(&handle, delete("clients", 1));
    assert!(sub.records().is_empty());

    rt.on_transport_event(&handle, delete("clients", 1));
    rt.on_transport_event(&handle, update("clients", json!({"id": 1, "name": "A3"})));
    assert_eq!(sub.records(), vec![json!({"id": 1, "name": "A3"})]);
}

// =============================================================================
// Buffering While Opening
// =============================================================================

/// Events that arrive during the snapshot fetch are applied after it, in
/// arrival order.
#[tokio::test]
async fn test_buffered_events_replayed_after_snapshot() {
    let transport = MockTransport::new();
    let store = MockStore::gated(vec![json!({"id": 1, "name": "A"})]);
    let rt = realtime(&transport, &store);
    let key = ChannelKey::entity("clients", None).unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let task = {
        let rt = rt.clone();
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            rt.subscribe_to_entity("clients", None, move |change| {
                log.lock().unwrap().push(row_label(change));
                Ok(())
            })
            .await
        })
    };

    store.gate.entered().await;
    let handle = transport.handle_for(&key);
    rt.on_transport_event(&handle, insert("clients", json!({"id": 2, "name": "B"})));
    rt.on_transport_event(&handle, update("clients", json!({"id": 1, "name": "A2"})));

    let info = rt.channel_info(&key).unwrap();
    assert_eq!(info.phase, Phase::Opening);
    assert_eq!(info.buffered, 2);
    assert!(log.lock().unwrap().is_empty());

    store.gate.release();
    let sub = task.await.unwrap().unwrap();

    assert_eq!(sub.initial_state(), &InitialState::Seeded);
    assert_eq!(*log.lock().unwrap(), vec!["INSERT:2", "UPDATE:1"]);
    assert_eq!(
        sub.records(),
        vec![json!({"id": 1, "name": "A2"}), json!({"id": 2, "name": "B"})]
    );
    assert_eq!(rt.channel_info(&key).unwrap().phase, Phase::Idle);
    assert_eq!(rt.metrics().events_buffered, 2);
}

/// A failed snapshot opens the channel degraded; buffered and later
/// inserts heal the cache.
#[tokio::test]
async fn test_snapshot_failure_with_buffered_events() {
    let transport = MockTransport::new();
    let store = MockStore::gated(vec![]);
    store.fail_with(RealtimeError::SnapshotFailed("query timeout".into()));
    let rt = realtime(&transport, &store);
    let key = ChannelKey::entity("clients", None).unwrap();

    let task = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.subscribe_to_entity("clients", None, |_| Ok(())).await })
    };

    store.gate.entered().await;
    let handle = transport.handle_for(&key);
    rt.on_transport_event(&handle, insert("clients", json!({"id": 5})));
    store.gate.release();

    let sub = task.await.unwrap().unwrap();
    assert!(sub.is_degraded());
    assert!(matches!(sub.initial_state(), InitialState::Degraded { reason } if reason.contains("query timeout")));
    assert_eq!(sub.records(), vec![json!({"id": 5})]);

    rt.on_transport_event(&handle, insert("clients", json!({"id": 6})));
    assert_eq!(sub.records().len(), 2);
    assert_eq!(rt.metrics().snapshot_failures, 1);
}

/// Overflowing the opening buffer drops events and degrades the channel.
#[tokio::test]
async fn test_buffer_overflow_degrades() {
    let transport = MockTransport::new();
    let store = MockStore::gated(vec![]);
    let config = RealtimeConfig {
        max_buffered_events: 2,
        ..Default::default()
    };
    let rt = realtime_with(config, &transport, &store);
    let key = ChannelKey::entity("clients", None).unwrap();

    let task = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.subscribe_to_entity("clients", None, |_| Ok(())).await })
    };

    store.gate.entered().await;
    let handle = transport.handle_for(&key);
    for id in 1..=3 {
        rt.on_transport_event(&handle, insert("clients", json!({ "id": id })));
    }
    store.gate.release();

    let sub = task.await.unwrap().unwrap();
    assert!(sub.is_degraded());
    assert_eq!(sub.records().len(), 2);
    assert_eq!(rt.metrics().events_dropped, 1);
}

// =============================================================================
// Re-entrancy
// =============================================================================

/// A subscriber released by an earlier callback in the same fan-out is
/// not invoked.
#[tokio::test]
async fn test_release_during_fan_out() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![]);
    let rt = realtime(&transport, &store);

    let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let victim_calls = Arc::new(AtomicUsize::new(0));

    let slot = Arc::clone(&victim);
    let killer = rt
        .subscribe_to_broadcast("chat", move |_| {
            // Dropping the subscription releases it
            slot.lock().unwrap().take();
            Ok(())
        })
        .await
        .unwrap();

    let counter = Arc::clone(&victim_calls);
    let sub = rt
        .subscribe_to_broadcast("chat", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    *victim.lock().unwrap() = Some(sub);

    let handle = transport.handle_for(killer.key());
    rt.on_transport_event(&handle, broadcast("ping", json!({})));

    assert_eq!(victim_calls.load(Ordering::SeqCst), 0);
    let info = rt.channel_info(killer.key()).unwrap();
    assert_eq!(info.subscribers, 1);

    // The released subscriber is skipped, not counted as a delivery
    let metrics = rt.metrics();
    assert_eq!(metrics.events_dispatched, 1);
    assert_eq!(metrics.deliveries, 1);
}

/// An event delivered from inside a callback is observed by everyone only
/// after the current event.
#[tokio::test]
async fn test_reentrant_delivery_is_queued() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![]);
    let rt = realtime(&transport, &store);
    let key = ChannelKey::broadcast("chat").unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let log = Arc::clone(&log);
        let rt_inner = rt.clone();
        let transport = Arc::clone(&transport);
        let key = key.clone();
        rt.subscribe_to_broadcast("chat", move |message| {
            log.lock().unwrap().push(format!("a:{}", message.event));
            if message.event == "e1" {
                let handle = transport.handle_for(&key);
                rt_inner.on_transport_event(&handle, broadcast("e2", json!({})));
            }
            Ok(())
        })
        .await
        .unwrap()
    };
    let second = {
        let log = Arc::clone(&log);
        rt.subscribe_to_broadcast("chat", move |message| {
            log.lock().unwrap().push(format!("b:{}", message.event));
            Ok(())
        })
        .await
        .unwrap()
    };

    let handle = transport.handle_for(&key);
    rt.on_transport_event(&handle, broadcast("e1", json!({})));

    assert_eq!(*log.lock().unwrap(), vec!["a:e1", "b:e1", "a:e2", "b:e2"]);

    // The callback holds a clone of the client; release explicitly
    rt.unsubscribe(first);
    rt.unsubscribe(second);
    assert!(rt.list_active_channels().is_empty());
}

/// A subscriber attached while an event is being dispatched only sees
/// later events.
#[tokio::test]
async fn test_subscriber_added_during_dispatch() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![]);
    let rt = realtime(&transport, &store);
    let key = ChannelKey::broadcast("chat").unwrap();
    let late_seen: Log = Arc::new(Mutex::new(Vec::new()));
    let pending = Arc::new(Mutex::new(None));

    let _first = {
        let rt_inner = rt.clone();
        let late_seen = Arc::clone(&late_seen);
        let pending = Arc::clone(&pending);
        rt.subscribe_to_broadcast("chat", move |message| {
            if message.event == "e1" {
                let rt_late = rt_inner.clone();
                let late_seen = Arc::clone(&late_seen);
                let join = tokio::spawn(async move {
                    rt_late
                        .subscribe_to_broadcast("chat", move |message| {
                            late_seen.lock().unwrap().push(message.event.clone());
                            Ok(())
                        })
                        .await
                });
                *pending.lock().unwrap() = Some(join);
            }
            Ok(())
        })
        .await
        .unwrap()
    };

    let handle = transport.handle_for(&key);
    rt.on_transport_event(&handle, broadcast("e1", json!({})));

    let join = pending.lock().unwrap().take().unwrap();
    let _late = join.await.unwrap().unwrap();
    rt.on_transport_event(&handle, broadcast("e2", json!({})));

    assert_eq!(*late_seen.lock().unwrap(), vec!["e2"]);
    rt.shutdown_all();
}

// =============================================================================
// Failure Isolation
// =============================================================================

/// Failing and panicking callbacks do not stop delivery or close the
/// channel.
#[tokio::test]
async fn test_callback_failures_isolated() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![]);
    let rt = realtime(&transport, &store);
    let delivered = Arc::new(AtomicUsize::new(0));

    let _failing = rt
        .subscribe_to_entity("clients", None, |_| Err("render failed".into()))
        .await
        .unwrap();
    let _panicking = rt
        .subscribe_to_entity("clients", None, |_| panic!("widget bug"))
        .await
        .unwrap();
    let counter = Arc::clone(&delivered);
    let healthy = rt
        .subscribe_to_entity("clients", None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let handle = transport.handle_for(healthy.key());
    rt.on_transport_event(&handle, insert("clients", json!({"id": 1})));
    rt.on_transport_event(&handle, insert("clients", json!({"id": 2})));

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert_eq!(rt.metrics().callback_failures, 4);
    assert_eq!(transport.close_count(), 0);
    assert_eq!(healthy.records().len(), 2);
}

/// Malformed or mismatched events are dropped without reaching callbacks.
#[tokio::test]
async fn test_invalid_events_dropped() {
    let transport = MockTransport::new();
    let store = MockStore::with_records(vec![]);
    let rt = realtime(&transport, &store);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let sub = rt
        .subscribe_to_entity("clients", None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    let handle = transport.handle_for(sub.key());

    // Wrong entity, wrong kind
    rt.on_transport_event(&handle, insert("invoices", json!({"id": 1})));
    rt.on_transport_event(&handle, broadcast("ping", Value::Null));
    rt.on_transport_event(&handle, insert("clients", json!({"id": 1})));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rt.metrics().events_dropped, 2);
}
