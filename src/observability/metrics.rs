//! Metrics registry for the realtime layer
//!
//! - Counters only, monotonic
//! - Thread-safe, relaxed atomics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    channels_opened: AtomicU64,
    channels_closed: AtomicU64,
    open_failures: AtomicU64,
    snapshot_failures: AtomicU64,
    events_received: AtomicU64,
    events_buffered: AtomicU64,
    events_dropped: AtomicU64,
    /// One per typed event fanned out
    events_dispatched: AtomicU64,
    /// One per callback invocation
    deliveries: AtomicU64,
    callback_failures: AtomicU64,
    broadcasts_sent: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        #[doc = concat!("Increment `", stringify!($field), "`")]
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl MetricsRegistry {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    counter!(increment_channels_opened, channels_opened);
    counter!(increment_channels_closed, channels_closed);
    counter!(increment_open_failures, open_failures);
    counter!(increment_snapshot_failures, snapshot_failures);
    counter!(increment_events_received, events_received);
    counter!(increment_events_buffered, events_buffered);
    counter!(increment_events_dropped, events_dropped);
    counter!(increment_events_dispatched, events_dispatched);
    counter!(increment_deliveries, deliveries);
    counter!(increment_callback_failures, callback_failures);
    counter!(increment_broadcasts_sent, broadcasts_sent);

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub open_failures: u64,
    pub snapshot_failures: u64,
    pub events_received: u64,
    pub events_buffered: u64,
    pub events_dropped: u64,
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub callback_failures: u64,
    pub broadcasts_sent: u64,
}
