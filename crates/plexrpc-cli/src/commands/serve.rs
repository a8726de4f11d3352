//! `plexrpc serve`.

use tracing::info;

use plexrpc_runtime::{Server, SignalHandler, SocketServer};

use crate::config::CliConfig;
use crate::demo;
use crate::error::CliResult;

/// Runs the echo server on the configured socket until SIGINT or SIGTERM.
pub async fn run(
    config: &CliConfig,
    socket_path: Option<&std::path::Path>,
    max_connections: Option<usize>,
) -> CliResult<()> {
    let mut server_config = config.server_config(config.socket_path(socket_path));
    if let Some(max) = max_connections {
        server_config = server_config.with_max_connections(max);
    }

    let server = Server::new(demo::router(demo::registry()?)?, config.connection_config())?;
    let listener = SocketServer::new(server_config).await?;

    let signals = SignalHandler::new();
    signals.spawn_listener();

    info!(
        socket = %listener.socket_path().display(),
        methods = ?server.router().methods(),
        "serving {}",
        demo::SERVICE
    );
    listener.run_until_shutdown(server, signals.shutdown()).await?;
    info!("server stopped");
    Ok(())
}
