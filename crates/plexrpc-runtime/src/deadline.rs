//! Deadlines and cancellation signals.
//!
//! Deadlines are absolute instants on the local clock. On the wire the
//! caller sends the remaining time and the receiving end converts it back
//! to its own clock.

use std::time::Duration;

use plexrpc_core::Status;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::Command;

/// Fires the cancellation of one call. The first status wins.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<Option<Status>>,
}

/// Observes the cancellation of one call.
///
/// Handlers select on [`CancelSignal::cancelled`] to stop early. A call
/// that completes normally never resolves it.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<Status>>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, CancelSignal { rx })
    }

    /// Returns false if the call was already cancelled.
    pub fn cancel(&self, status: Status) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_source, signal) = CancelSource::new();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Cancellation status, if the call was cancelled.
    pub fn status(&self) -> Option<Status> {
        self.rx.borrow().clone()
    }

    /// Waits until the call is cancelled and returns why.
    pub async fn cancelled(&self) -> Status {
        let mut rx = self.rx.clone();
        let fired = rx
            .wait_for(Option::is_some)
            .await
            .map(|status| status.clone())
            .ok()
            .flatten();
        match fired {
            Some(status) => status,
            None => std::future::pending().await,
        }
    }
}

/// Absolute deadline `timeout` from now.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

/// Time left until `deadline`, zero once it has passed.
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// The earlier of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Timer task that reports an expired deadline to the coordinator.
///
/// Aborted when dropped, so a call that finishes first leaves nothing
/// behind.
#[derive(Debug)]
pub(crate) struct DeadlineTimer {
    task: JoinHandle<()>,
}

impl DeadlineTimer {
    pub(crate) fn arm(
        deadline: Instant,
        stream_id: u32,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = commands.send(Command::DeadlineExpired { stream_id });
        });
        Self { task }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
