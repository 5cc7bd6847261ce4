use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "civic-telescope", version, about = "Civic backend with request/query/exception capture")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server (default)
    Start,

    /// Inspect captured requests
    Requests {
        #[command(subcommand)]
        action: RequestsCommands,
    },

    /// Inspect captured exceptions
    Exceptions {
        #[command(subcommand)]
        action: ExceptionsCommands,
    },

    /// Manage the capture store
    Storage {
        #[command(subcommand)]
        action: StorageCommands,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone)]
pub enum RequestsCommands {
    /// List captured requests, newest first
    List {
        /// Filter by HTTP method
        #[arg(short, long)]
        method: Option<String>,

        /// Filter by status code
        #[arg(short, long)]
        status: Option<i64>,

        /// Filter by authenticated user id
        #[arg(short, long)]
        user: Option<String>,

        /// Substring search over path, URL, IP and user agent
        #[arg(long)]
        search: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Number of results to skip
        #[arg(long, default_value = "0")]
        offset: i64,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one request with its queries
    Show {
        /// Request UUID
        uuid: String,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ExceptionsCommands {
    /// List captured exceptions, newest first
    List {
        /// Filter by exception type
        #[arg(short = 't', long = "type")]
        kind: Option<String>,

        /// Substring search over type and message
        #[arg(long)]
        search: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: i64,

        /// Number of results to skip
        #[arg(long, default_value = "0")]
        offset: i64,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one exception with its stack trace
    Show {
        /// Exception UUID
        uuid: String,

        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum StorageCommands {
    /// Show row counts per capture table
    Stats,

    /// Delete captured data
    Clear {
        /// Clear requests (and their queries)
        #[arg(long)]
        requests: bool,

        /// Clear exceptions
        #[arg(long)]
        exceptions: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Enforce retention caps now
    Prune,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display the effective configuration
    Show,

    /// Validate configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Start if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start)
    }
}
