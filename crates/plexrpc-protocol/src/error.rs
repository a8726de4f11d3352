//! Protocol error types.

use plexrpc_core::{Code, Status};
use thiserror::Error;

/// Result type for framing operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Connection-level framing errors. Any of these is fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: u32 },

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte channel closed in the middle of a frame.
    #[error("incomplete frame: channel closed with {received} buffered bytes")]
    IncompleteFrame { received: usize },

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownFrameKind(u8),

    /// Stream id or length prefix is not a valid varint.
    #[error("malformed frame header: {0}")]
    MalformedHeader(VarintError),

    #[error("stream id {0} is out of range")]
    StreamIdOutOfRange(u64),
}

/// Varint decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarintError {
    #[error("truncated varint")]
    Truncated,

    #[error("varint overflows 64 bits")]
    Overflow,
}

/// Message and control-payload encoding errors.
///
/// These terminate a single call, never the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Malformed or truncated bytes, or a value the wire type cannot carry.
    #[error("wire format error: {0}")]
    WireFormat(String),

    /// A value or wire type is inconsistent with the descriptor.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Field name not present in the message descriptor.
    #[error("{message} has no field named {field:?}")]
    UnknownField { message: String, field: String },
}

impl CodecError {
    pub(crate) fn wire(message: impl Into<String>) -> Self {
        Self::WireFormat(message.into())
    }

    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        Self::SchemaMismatch(message.into())
    }

    /// Status code this error surfaces as.
    pub fn code(&self) -> Code {
        match self {
            Self::WireFormat(_) => Code::WireFormatError,
            Self::SchemaMismatch(_) | Self::UnknownField { .. } => Code::SchemaMismatch,
        }
    }
}

impl From<VarintError> for CodecError {
    fn from(err: VarintError) -> Self {
        Self::WireFormat(err.to_string())
    }
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<ProtocolError> for Status {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Status::unavailable(format!("transport error: {e}")),
            other => Status::unavailable(format!("connection failed: {other}")),
        }
    }
}
