use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::{
    domain::types::ItemState,
    purge::{PurgeMode, QueueKind},
};

/// Command-line arguments for the edgepurge binary.
#[derive(Debug, Parser)]
#[command(name = "edgepurge", version, about = "Queue-backed edge cache invalidation")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "EDGEPURGE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the scheduled consumer, the cleanup sweep and the admin API.
    Serve(Box<ServeArgs>),
    /// Run one consumer pass and exit.
    Tick(RunArgs),
    /// Delete queue items past the retention window and exit.
    Cleanup(RunArgs),
    /// Request a purge for a piece of content.
    Purge(PurgeArgs),
    /// Inspect or empty the purge queues.
    Queue(QueueArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    /// Override the admin listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub admin_host: Option<String>,

    /// Override the admin listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Override the consumer tick cron expression.
    #[arg(long = "purge-tick-schedule", value_name = "CRON")]
    pub tick_schedule: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub logging: LoggingOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the purge mode (deferred|immediate).
    #[arg(long = "mode", value_name = "MODE")]
    pub mode: Option<PurgeMode>,

    #[command(subcommand)]
    pub target: PurgeCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum PurgeCommand {
    /// Everything a post appears on.
    Post { id: i64 },
    /// A term's archives.
    Term { id: i64 },
    /// A single URL, absolute or relative to the site.
    Url { url: String },
    /// A provider cache tag.
    Tag { tag: String },
    /// The whole site.
    All,
}

#[derive(Debug, Args, Clone)]
pub struct QueueArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(subcommand)]
    pub command: QueueCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum QueueCommand {
    /// Item counts per state.
    Stats {
        #[arg(value_name = "QUEUE")]
        queue: QueueKind,
    },
    /// List items, oldest first.
    List {
        #[arg(value_name = "QUEUE")]
        queue: QueueKind,

        /// Only items in this state (available|reserved|completed|failed).
        #[arg(long, value_parser = parse_item_state)]
        state: Option<ItemState>,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Delete the listed items.
    Delete {
        #[arg(value_name = "QUEUE")]
        queue: QueueKind,

        #[arg(value_name = "ID", required = true, num_args = 1..)]
        ids: Vec<i64>,
    },
    /// Delete every item of the queue.
    Clear {
        #[arg(value_name = "QUEUE")]
        queue: QueueKind,
    },
}

fn parse_item_state(value: &str) -> Result<ItemState, String> {
    ItemState::try_from(value).map_err(|err| err.to_string())
}
