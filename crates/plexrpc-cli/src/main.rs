//! plexrpc CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use plexrpc_cli::cli::{Cli, Command, ConfigAction};
use plexrpc_cli::commands::{self, call::CallArgs};
use plexrpc_cli::{CliConfig, CliError, CliResult};
use plexrpc_core::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config_path = cli.config.clone().unwrap_or_else(CliConfig::default_path);
    let config = if cli.config.is_some() {
        CliConfig::load_from(&config_path)?
    } else {
        CliConfig::load()?
    };

    init_tracing(config.tracing_config(cli.debug)?)
        .map_err(|e| CliError::Config(e.to_string()))?;

    let socket_path = cli.socket_path.as_deref();
    match cli.command {
        Command::Serve { max_connections } => {
            commands::serve::run(&config, socket_path, max_connections).await
        }
        Command::Call {
            method,
            texts,
            repeat,
            timeout_ms,
            metadata,
            json,
        } => {
            let args = CallArgs {
                method,
                texts,
                repeat,
                timeout_ms,
                metadata,
                json,
            };
            commands::call::run(&config, socket_path, args).await
        }
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, &config_path),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(&config_path),
        },
    }
}
