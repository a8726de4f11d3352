//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// plexrpc - multiplexed RPC over a local socket
#[derive(Debug, Parser)]
#[command(name = "plexrpc")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "PLEXRPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Path to the server socket
    #[arg(long, env = "PLEXRPC_SOCKET")]
    pub socket_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the demo echo server in the foreground
    Serve {
        /// Maximum concurrent client connections
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Call a method of the demo echo server
    Call {
        /// Method to invoke
        #[arg(value_enum)]
        method: DemoMethod,

        /// Request texts; streaming methods send one message per text
        #[arg(required = true)]
        texts: Vec<String>,

        /// How many replies `expand` asks for
        #[arg(long, default_value_t = 3)]
        repeat: u32,

        /// Call timeout in milliseconds
        #[arg(long, env = "PLEXRPC_TIMEOUT_MS")]
        timeout_ms: Option<u64>,

        /// Request metadata entry, `key=value` (can be repeated)
        #[arg(long = "metadata", short = 'm', action = clap::ArgAction::Append)]
        metadata: Vec<String>,

        /// Print replies as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Methods of `plexrpc.demo.Echo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoMethod {
    /// Unary: echo one text
    Say,
    /// Server streaming: repeat one text
    Expand,
    /// Client streaming: join all texts
    Collect,
    /// Bidirectional: echo each text as it is sent
    Chat,
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}
