//! Unix socket listener.
//!
//! Binds the server socket, accepts connections up to the configured
//! limit and serves each one with a [`Server`] until shutdown.

use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Server;
use crate::error::{RuntimeError, RuntimeResult};
use crate::signals::ShutdownSignal;

/// Unix socket server for plexrpc connections.
pub struct SocketServer {
    /// Server configuration.
    config: ServerConfig,
    /// Unix socket listener.
    listener: UnixListener,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
}

impl SocketServer {
    /// Binds the socket path of `config`.
    ///
    /// With `cleanup_stale_socket`, a leftover socket file nobody listens
    /// on is removed first. A live socket is never taken over.
    pub async fn new(config: ServerConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let socket_path = &config.socket_path;

        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            return Err(RuntimeError::socket_path_invalid(
                parent.to_string_lossy().to_string(),
            ));
        }

        if socket_path.exists() {
            let in_use = || RuntimeError::socket_in_use(socket_path.to_string_lossy().to_string());
            if !config.cleanup_stale_socket {
                return Err(in_use());
            }
            // a successful connect means another server owns it
            if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
                return Err(in_use());
            }
            info!(path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "Socket server listening");

        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Ok(Self {
            config,
            listener,
            connection_semaphore,
        })
    }

    /// Returns the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections and serves them with `server` until `shutdown`
    /// fires.
    ///
    /// Once draining starts the listener stops accepting and every open
    /// connection sends GOAWAY; this returns when they have all closed, or
    /// right away when shutdown is forced.
    pub async fn run_until_shutdown(
        &self,
        server: Server,
        shutdown: ShutdownSignal,
    ) -> RuntimeResult<()> {
        let mut connections = JoinSet::new();
        let stopped = shutdown.clone().wait();
        tokio::pin!(stopped);

        loop {
            let permit = tokio::select! {
                permit = self.connection_semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = &mut stopped => break,
            };

            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                () = &mut stopped => break,
            };
            debug!(active = connections.len() + 1, "Accepted new connection");

            let server = server.clone();
            let shutdown = shutdown.clone();
            connections.spawn(async move {
                server.serve_connection_until(stream, shutdown.wait()).await;
                drop(permit);
            });

            // reap finished connections so the set does not grow unbounded
            while let Some(joined) = connections.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "Connection task failed");
                }
            }
        }

        info!(open = connections.len(), "Draining connections");
        let forced = shutdown.forced();
        tokio::pin!(forced);
        loop {
            tokio::select! {
                joined = connections.join_next() => match joined {
                    Some(Err(e)) if !e.is_cancelled() => {
                        warn!(error = %e, "Connection task failed");
                    }
                    Some(_) => {}
                    None => break,
                },
                () = &mut forced => {
                    warn!(open = connections.len(), "Shutdown forced; dropping connections");
                    connections.shutdown().await;
                    break;
                }
            }
        }
        Ok(())
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.config.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
                warn!(
                    path = %self.config.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            } else {
                debug!(
                    path = %self.config.socket_path.display(),
                    "Removed socket file"
                );
            }
        }
    }
}
