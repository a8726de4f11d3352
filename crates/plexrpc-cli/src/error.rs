//! CLI error types.

use plexrpc_core::{Code, Status};
use plexrpc_protocol::CodecError;
use plexrpc_runtime::RuntimeError;
use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that can occur in the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid command-line input.
    #[error("invalid argument: {0}")]
    Usage(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connecting or serving failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A message could not be built or encoded.
    #[error("message error: {0}")]
    Codec(#[from] CodecError),

    /// The call ended with a non-OK status.
    #[error("call failed with {}: {}", .0.code(), .0.message())]
    Call(Status),
}

impl From<Status> for CliError {
    fn from(status: Status) -> Self {
        Self::Call(status)
    }
}

impl CliError {
    /// Status code of a failed call, if this is one.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Call(status) => Some(status.code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_errors_show_code_and_message() {
        let err = CliError::from(Status::deadline_exceeded("deadline exceeded"));
        assert_eq!(
            err.to_string(),
            "call failed with DEADLINE_EXCEEDED: deadline exceeded"
        );
        assert_eq!(err.code(), Some(Code::DeadlineExceeded));
    }

    #[test]
    fn runtime_errors_are_transparent() {
        let err = CliError::from(RuntimeError::socket_in_use("/tmp/x.sock"));
        assert_eq!(err.to_string(), "Socket path already in use: /tmp/x.sock");
        assert_eq!(err.code(), None);
    }
}
