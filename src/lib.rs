//! aerosync - realtime data synchronization layer
//!
//! Deduplicated channels, local projection caches, presence rosters and
//! broadcast relay over a single transport.

pub mod cli;
pub mod observability;
pub mod realtime;
