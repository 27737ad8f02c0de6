//! CLI module for aerosync
//!
//! Provides command-line interface for:
//! - watch-entity: Print row changes of an entity
//! - watch-presence: Print a room's joins and leaves
//! - watch-broadcast: Print messages on a topic
//! - send: Broadcast one message
//! - check-config: Validate configuration

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command, Common};
pub use commands::{
    check_config, load_config, run, run_command, send, watch_broadcast, watch_entity,
    watch_presence,
};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_payload, write_error, write_event, write_response};
