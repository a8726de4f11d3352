//! Runtime: connections, calls, client stubs, server dispatch.
//!
//! This crate drives plexrpc calls over any byte stream:
//! - a connection multiplexer running many calls on one transport
//! - per-call state machines, flow-control windows and deadlines
//! - interceptor chains on both client and server
//! - a Unix socket server with graceful shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use plexrpc_core::DescriptorRegistry;
//! use plexrpc_runtime::{ConnectionConfig, Router, Server, ServerConfig, SignalHandler, SocketServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(DescriptorRegistry::builder().build()?);
//!     let router = Router::builder(registry).build()?;
//!     let server = Server::new(router, ConnectionConfig::default())?;
//!
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener();
//!     let socket = SocketServer::new(ServerConfig::default()).await?;
//!     socket.run_until_shutdown(server, signals.shutdown()).await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod interceptor;
pub mod signals;
#[cfg(unix)]
pub mod socket;

#[cfg(test)]
mod tests;

pub use call::{CallPhase, CallState, Direction, Side};
pub use client::{CallOptions, Client, Response, Streaming};
pub use config::{
    ConnectionConfig, DEFAULT_INITIAL_WINDOW, DEFAULT_MAX_MESSAGE_SIZE, ServerConfig,
    default_socket_path,
};
pub use connection::{
    CallCompletion, CallHandle, CallInfo, CallReceiver, CallSender, Completion, Connection,
};
pub use deadline::{CancelSignal, CancelSource};
pub use dispatch::{
    Request, RequestContext, RequestStream, ResponseSink, Router, RouterBuilder, Server,
};
pub use error::{CallError, RuntimeError, RuntimeResult};
pub use flow::{FlowControlError, RecvWindow, SendWindow};
pub use interceptor::{BoxFuture, CallContext, Interceptor, LoggingInterceptor, Next};
pub use signals::{ShutdownHandle, ShutdownPhase, ShutdownSignal, SignalHandler};
#[cfg(unix)]
pub use socket::SocketServer;
