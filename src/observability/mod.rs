//! Observability for the realtime layer
//!
//! - Structured logging (JSON lines)
//! - Typed lifecycle events
//! - Counter metrics
//!
//! Observability is read-only: it never changes dispatch behavior, and a
//! failed log write is ignored.
//!
//! ```ignore
//! use aerosync::observability::{log_event_with_fields, Event};
//!
//! log_event_with_fields(Event::ChannelOpen, &[("channel", "entity:clients/*")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log a lifecycle event at its own severity
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
