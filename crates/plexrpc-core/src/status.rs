//! Canonical call outcome codes and the [`Status`] carried by every trailer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome kind of a call.
///
/// Numeric values are what travels on the wire. Values shared with the
/// common RPC status space keep their conventional numbers; codes specific
/// to this runtime start at 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum Code {
    Ok = 0,
    /// The caller cancelled the call.
    Cancelled = 1,
    /// Unrecognised code received from a peer.
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    /// Too many concurrent streams, or the dispatch backlog is full.
    ResourceExhausted = 8,
    /// The call pattern's message cardinality was violated.
    FailedPrecondition = 9,
    /// No handler is registered for the method.
    Unimplemented = 12,
    /// Uncaught handler fault.
    Internal = 13,
    /// Transport failure.
    Unavailable = 14,
    /// Malformed or truncated bytes.
    WireFormatError = 32,
    /// Wire type inconsistent with the descriptor.
    SchemaMismatch = 33,
    /// A peer exceeded its credit window.
    FlowControlViolation = 34,
    /// Frame or operation on a stream that already reached a terminal state.
    StreamAlreadyClosed = 35,
    /// The connection was closed. A specialization of [`Code::Unavailable`].
    ConnectionClosed = 36,
}

impl Code {
    /// Parses a wire value. Unrecognised values map to [`Code::Unknown`].
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            32 => Self::WireFormatError,
            33 => Self::SchemaMismatch,
            34 => Self::FlowControlViolation,
            35 => Self::StreamAlreadyClosed,
            36 => Self::ConnectionClosed,
            _ => Self::Unknown,
        }
    }

    /// Returns the wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// True for transport loss, including the connection-closed specialization.
    pub fn is_unavailable(self) -> bool {
        matches!(self, Self::Unavailable | Self::ConnectionClosed)
    }

    /// Returns the canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::WireFormatError => "WIRE_FORMAT_ERROR",
            Self::SchemaMismatch => "SCHEMA_MISMATCH",
            Self::FlowControlViolation => "FLOW_CONTROL_VIOLATION",
            Self::StreamAlreadyClosed => "STREAM_ALREADY_CLOSED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result status of a call: code, human-readable message, optional opaque detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<Vec<u8>>,
}

impl Status {
    /// Creates a status with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Builder: attach opaque detail bytes.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<Vec<u8>>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn wire_format(message: impl Into<String>) -> Self {
        Self::new(Code::WireFormatError, message)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::new(Code::SchemaMismatch, message)
    }

    pub fn flow_control_violation(message: impl Into<String>) -> Self {
        Self::new(Code::FlowControlViolation, message)
    }

    pub fn stream_already_closed(message: impl Into<String>) -> Self {
        Self::new(Code::StreamAlreadyClosed, message)
    }

    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::new(Code::ConnectionClosed, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&[u8]> {
        self.details.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Converts an OK status into `Ok(())` and anything else into `Err(self)`.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }
}
