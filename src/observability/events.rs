//! Observable lifecycle events of the realtime layer
//!
//! Events are explicit and typed; each has a fixed log name and severity.

use std::fmt;

use super::logger::Severity;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Lifecycle
    /// Configuration loaded
    ConfigLoaded,
    /// `shutdown_all` started
    ShutdownStart,
    /// `shutdown_all` finished
    ShutdownComplete,

    // Channels
    /// Transport channel opened
    ChannelOpen,
    /// Transport open failed
    ChannelOpenFailed,
    /// Transport channel closed
    ChannelClose,
    /// Subscriber attached to an existing channel
    ChannelAttach,
    /// Subscriber released
    ChannelRelease,

    // Snapshot
    /// Projection seeded from snapshot
    SnapshotSeeded,
    /// Snapshot fetch failed, channel degraded
    SnapshotFailed,
    /// Buffered events replayed after snapshot
    BufferReplayed,
    /// Buffer overflow while opening
    BufferOverflow,

    // Dispatch
    /// Typed event fanned out to a channel's subscribers
    EventDispatched,
    /// Subscriber callback failed or panicked
    CallbackFailed,
    /// Event for a closed or replaced channel
    StaleEventDropped,
    /// Event that could not be classified or applied
    InvalidEvent,
    /// Presence reconciled from full state
    PresenceReconciled,

    // Outbound
    /// Broadcast sent
    BroadcastSent,
    /// Outbound message rejected or failed
    SendFailed,

    // Transport connection
    /// Transport connected
    TransportConnected,
    /// Transport disconnected
    TransportDisconnected,
}

impl Event {
    /// Returns the log name
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",

            Event::ChannelOpen => "CHANNEL_OPEN",
            Event::ChannelOpenFailed => "CHANNEL_OPEN_FAILED",
            Event::ChannelClose => "CHANNEL_CLOSE",
            Event::ChannelAttach => "CHANNEL_ATTACH",
            Event::ChannelRelease => "CHANNEL_RELEASE",

            Event::SnapshotSeeded => "SNAPSHOT_SEEDED",
            Event::SnapshotFailed => "SNAPSHOT_FAILED",
            Event::BufferReplayed => "BUFFER_REPLAYED",
            Event::BufferOverflow => "BUFFER_OVERFLOW",

            Event::EventDispatched => "EVENT_DISPATCHED",
            Event::CallbackFailed => "CALLBACK_FAILED",
            Event::StaleEventDropped => "STALE_EVENT_DROPPED",
            Event::InvalidEvent => "INVALID_EVENT",
            Event::PresenceReconciled => "PRESENCE_RECONCILED",

            Event::BroadcastSent => "BROADCAST_SENT",
            Event::SendFailed => "SEND_FAILED",

            Event::TransportConnected => "TRANSPORT_CONNECTED",
            Event::TransportDisconnected => "TRANSPORT_DISCONNECTED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::ChannelOpenFailed | Event::CallbackFailed => Severity::Error,
            Event::SnapshotFailed
            | Event::BufferOverflow
            | Event::InvalidEvent
            | Event::SendFailed
            | Event::TransportDisconnected => Severity::Warn,
            Event::ChannelAttach
            | Event::ChannelRelease
            | Event::StaleEventDropped
            | Event::BroadcastSent
            | Event::BufferReplayed
            | Event::EventDispatched => Severity::Trace,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
