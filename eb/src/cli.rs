//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

/// eb - durable event bus for platform services
#[derive(Parser)]
#[command(
    name = "eb",
    about = "Publish, inspect and consume platform events",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish one event
    Publish {
        /// Producing service, e.g. webhook:telegram
        #[arg(short, long)]
        source: String,

        /// Event type, e.g. message
        #[arg(short = 't', long = "type")]
        event_type: String,

        /// JSON payload (defaults to {})
        #[arg(short, long)]
        payload: Option<String>,

        /// Correlation id for request tracing
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Show the most recent events, newest first
    History {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List consumer groups with cursor and pending count
    Groups,

    /// Manage consumer groups
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },

    /// Show entries delivered to a group but not yet acknowledged
    Pending {
        /// Consumer group name
        group: String,

        /// Number of pending entries to list
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Consume a group, printing each event, until SIGINT/SIGTERM
    Consume {
        /// Consumer group name
        group: String,

        /// Consumer name; a stable name resumes its own pending entries after restart
        #[arg(long)]
        consumer: Option<String>,
    },
}

/// Consumer group subcommands
#[derive(Debug, Subcommand)]
pub enum GroupCommand {
    /// Create a group (no-op if it exists)
    Create {
        /// Consumer group name
        name: String,

        /// Start from the first entry instead of only new ones
        #[arg(long)]
        from_start: bool,
    },
}

/// Output format for listing commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eventbus")
        .join("logs")
        .join("eventbus.log")
}
