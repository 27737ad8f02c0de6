//! CLI argument definitions using clap
//!
//! Commands:
//! - aerosync watch-entity --entity <name> [--filter <col=op.value>]
//! - aerosync watch-presence --room <room> [--name <display name>]
//! - aerosync watch-broadcast --topic <topic>
//! - aerosync send --topic <topic> --event <name> [--payload <json>]
//! - aerosync check-config

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// aerosync - realtime channels, projections and presence from the terminal
#[derive(Parser, Debug)]
#[command(name = "aerosync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct Common {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the WebSocket endpoint
    #[arg(long)]
    pub url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print row changes of an entity as JSON lines
    WatchEntity {
        #[command(flatten)]
        common: Common,

        /// Entity (table) name
        #[arg(long)]
        entity: String,

        /// Row filter, e.g. `status=eq."open"`
        #[arg(long)]
        filter: Option<String>,
    },

    /// Print presence joins and leaves of a room
    WatchPresence {
        #[command(flatten)]
        common: Common,

        /// Room name
        #[arg(long)]
        room: String,

        /// Track own presence under this display name
        #[arg(long)]
        name: Option<String>,
    },

    /// Print messages broadcast on a topic
    WatchBroadcast {
        #[command(flatten)]
        common: Common,

        /// Topic name
        #[arg(long)]
        topic: String,
    },

    /// Broadcast one message and exit
    Send {
        #[command(flatten)]
        common: Common,

        /// Topic name
        #[arg(long)]
        topic: String,

        /// Event name
        #[arg(long)]
        event: String,

        /// JSON payload (read from stdin when omitted)
        #[arg(long)]
        payload: Option<String>,
    },

    /// Validate a configuration file and print the effective config
    CheckConfig {
        #[command(flatten)]
        common: Common,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
