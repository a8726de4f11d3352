//! Runtime error types.

use std::io;

use plexrpc_core::{CallPattern, Status};
use plexrpc_protocol::ProtocolError;
use thiserror::Error;

use crate::call::Direction;

/// Result type for runtime setup operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised while setting up servers, listeners and connections.
///
/// Errors of individual calls are reported as [`Status`] instead.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Framing error on a connection.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket path already in use.
    #[error("Socket path already in use: {path}")]
    SocketInUse { path: String },

    /// Socket path parent directory does not exist.
    #[error("Socket path parent directory does not exist: {path}")]
    SocketPathInvalid { path: String },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A handler could not be registered.
    #[error("Cannot register {path}: {message}")]
    Registration { path: String, message: String },
}

impl RuntimeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn socket_in_use(path: impl Into<String>) -> Self {
        Self::SocketInUse { path: path.into() }
    }

    pub fn socket_path_invalid(path: impl Into<String>) -> Self {
        Self::SocketPathInvalid { path: path.into() }
    }

    pub fn registration(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registration {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A call operation the state machine refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("call already finished")]
    Terminated,

    #[error("{0} direction already closed")]
    AlreadyClosed(Direction),

    #[error("{0} header must come before messages")]
    HeaderNotSent(Direction),

    #[error("header already sent")]
    HeaderAlreadySent,

    #[error("{pattern} call carries exactly one {direction} message")]
    TooManyMessages {
        pattern: CallPattern,
        direction: Direction,
    },

    #[error("{pattern} call closed its {direction} direction without its message")]
    MissingMessage {
        pattern: CallPattern,
        direction: Direction,
    },
}

impl From<CallError> for Status {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Terminated | CallError::AlreadyClosed(_) => {
                Status::stream_already_closed(err.to_string())
            }
            other => Status::failed_precondition(other.to_string()),
        }
    }
}
