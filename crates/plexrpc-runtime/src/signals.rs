//! Two-stage shutdown for socket servers.
//!
//! The first SIGTERM or SIGINT moves the server to [`ShutdownPhase::Draining`]:
//! it stops accepting and every connection sends GOAWAY, letting open calls
//! finish. A second signal moves it to [`ShutdownPhase::Forced`] and the
//! remaining connections are dropped.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

/// Where a server is in its shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Forced,
}

/// Owns the shutdown state and turns process signals into phase changes.
pub struct SignalHandler {
    phase: Arc<watch::Sender<ShutdownPhase>>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            phase: Arc::new(phase),
        }
    }

    /// Spawns a task that advances the phase on every SIGTERM or SIGINT.
    ///
    /// Needs a running tokio runtime.
    #[cfg(unix)]
    pub fn spawn_listener(&self) {
        let handle = self.shutdown_handle();

        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};

            let (mut term, mut int) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "cannot install signal handlers");
                        return;
                    }
                };

            loop {
                let name = tokio::select! {
                    _ = term.recv() => "SIGTERM",
                    _ = int.recv() => "SIGINT",
                };
                if handle.advance() == ShutdownPhase::Forced {
                    info!(signal = name, "forcing shutdown");
                    return;
                }
                info!(signal = name, "draining connections; signal again to force");
            }
        });
    }

    #[cfg(not(unix))]
    pub fn spawn_listener(&self) {
        let handle = self.shutdown_handle();

        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if handle.advance() == ShutdownPhase::Forced {
                    info!("forcing shutdown");
                    return;
                }
                info!("draining connections; Ctrl+C again to force");
            }
        });
    }

    pub fn shutdown(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.phase.subscribe(),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Starts draining, as the first signal would.
    pub fn trigger_shutdown(&self) {
        self.shutdown_handle().drain();
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            phase: self.phase.clone(),
        }
    }
}

/// Waits for shutdown phases.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownSignal {
    /// Resolves once draining starts.
    ///
    /// Also resolves if the [`SignalHandler`] and every handle are gone.
    pub async fn wait(self) {
        self.reach(ShutdownPhase::Draining).await;
    }

    /// Resolves once shutdown is forced.
    pub async fn forced(self) {
        self.reach(ShutdownPhase::Forced).await;
    }

    async fn reach(mut self, phase: ShutdownPhase) {
        let _ = self.rx.wait_for(|current| *current >= phase).await;
    }
}

/// Moves the shutdown phase forward from anywhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    phase: Arc<watch::Sender<ShutdownPhase>>,
}

impl ShutdownHandle {
    /// Starts draining; no-op past that point.
    pub fn drain(&self) {
        self.raise(ShutdownPhase::Draining);
    }

    pub fn force(&self) {
        self.raise(ShutdownPhase::Forced);
    }

    /// One step forward, returning the new phase.
    pub fn advance(&self) -> ShutdownPhase {
        let mut next = ShutdownPhase::Forced;
        self.phase.send_modify(|phase| {
            *phase = match *phase {
                ShutdownPhase::Running => ShutdownPhase::Draining,
                _ => ShutdownPhase::Forced,
            };
            next = *phase;
        });
        next
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn wait(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.phase.subscribe(),
        }
    }

    fn raise(&self, to: ShutdownPhase) {
        self.phase.send_if_modified(|phase| {
            if *phase < to {
                *phase = to;
                true
            } else {
                false
            }
        });
    }
}
