//! Interceptor chain.
//!
//! Interceptors wrap a call the way an onion wraps its core: each one runs
//! its "before" part, hands the call to [`Next`], then runs its "after"
//! part on the way out. An interceptor that returns without calling
//! `next` short-circuits everything inside it, but the interceptors that
//! already ran still see the returned status.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
pub use futures_util::future::BoxFuture;
use plexrpc_core::{Metadata, Status};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::call::Side;
use crate::deadline::CancelSignal;

/// Per-call state visible to interceptors.
#[derive(Debug, Clone)]
pub struct CallContext {
    side: Side,
    method: String,
    metadata: Metadata,
    trailers: Metadata,
    deadline: Option<Instant>,
    cancel: CancelSignal,
}

impl CallContext {
    pub(crate) fn new(
        side: Side,
        method: impl Into<String>,
        metadata: Metadata,
        deadline: Option<Instant>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            side,
            method: method.into(),
            metadata,
            trailers: Metadata::new(),
            deadline,
            cancel,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Method path, `/<service>/<method>`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request metadata. Client interceptors may add to it before the call
    /// is opened.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Trailer metadata. Filled in from the peer on the client; sent with
    /// the final status on the server.
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }

    pub fn trailers_mut(&mut self) -> &mut Metadata {
        &mut self.trailers
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Tightens or sets the deadline. Only honoured before the call opens.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub(crate) fn set_cancel_signal(&mut self, cancel: CancelSignal) {
        self.cancel = cancel;
    }
}

/// A layer around every call of a client or server.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept<'a>(&'a self, ctx: &'a mut CallContext, next: Next<'a>) -> BoxFuture<'a, Status>;
}

/// The innermost step of a chain: the handler or the actual call.
///
/// It only borrows the context while its future runs, so every layer
/// can still read the context once `next` has returned.
pub(crate) type Terminal =
    Box<dyn for<'c> FnOnce(&'c mut CallContext) -> BoxFuture<'c, Status> + Send>;

pub(crate) fn terminal<F>(f: F) -> Terminal
where
    F: for<'c> FnOnce(&'c mut CallContext) -> BoxFuture<'c, Status> + Send + 'static,
{
    Box::new(f)
}

/// The rest of the chain, from one interceptor's point of view.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    terminal: Terminal,
}

impl<'a> Next<'a> {
    /// Runs the remaining interceptors and the call itself.
    ///
    /// `ctx` is borrowed only until the returned future completes.
    pub fn run<'b>(self, ctx: &'b mut CallContext) -> BoxFuture<'b, Status>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                ctx,
                Next {
                    rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(ctx),
        }
    }
}

/// Runs `interceptors` in order around `terminal`.
///
/// A panicking interceptor ends the call with `INTERNAL`.
pub(crate) async fn run_chain(
    interceptors: &[Arc<dyn Interceptor>],
    ctx: &mut CallContext,
    terminal: Terminal,
) -> Status {
    let chain = Next {
        rest: interceptors,
        terminal,
    }
    .run(ctx);
    match AssertUnwindSafe(chain).catch_unwind().await {
        Ok(status) => status,
        Err(_) => {
            error!("interceptor panicked");
            Status::internal("interceptor panicked")
        }
    }
}

/// Logs method, side, latency and final status of every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept<'a>(&'a self, ctx: &'a mut CallContext, next: Next<'a>) -> BoxFuture<'a, Status> {
        Box::pin(async move {
            let started = Instant::now();
            let method = ctx.method().to_owned();
            let side = ctx.side();
            debug!(%method, %side, "call started");

            let status = next.run(ctx).await;

            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if status.is_ok() {
                info!(%method, %side, elapsed_ms, "call ok");
            } else {
                warn!(
                    %method,
                    %side,
                    elapsed_ms,
                    code = %status.code(),
                    message = status.message(),
                    "call failed"
                );
            }
            status
        })
    }
}
