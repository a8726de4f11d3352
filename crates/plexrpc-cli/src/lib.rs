//! The `plexrpc` command-line interface.
//!
//! `plexrpc serve` runs the demo echo service on a Unix socket and
//! `plexrpc call` talks to it.

pub mod cli;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;

pub use cli::Cli;
pub use config::CliConfig;
pub use error::{CliError, CliResult};
