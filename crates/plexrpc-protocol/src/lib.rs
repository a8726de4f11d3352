//! Wire format for plexrpc.
//!
//! # Layers
//!
//! - [`varint`] and [`wire`]: tag/value primitives shared by messages and
//!   control payloads.
//! - [`codec`]: schema-driven encoding of [`DynamicMessage`]s, canonical on
//!   output and tolerant of field order, packing and unknown fields on input.
//! - [`frame`]: multiplexed frames over one ordered byte channel.
//! - [`control`]: HEADER, TRAILER, CANCEL, GOAWAY and CREDIT payloads.
//!
//! # Example
//!
//! ```rust
//! use plexrpc_protocol::{Decoded, Frame, FrameKind, HeaderBlock};
//!
//! let header = HeaderBlock::request("/demo.Echo/Say", None, Default::default());
//! let frame = Frame::new(1, FrameKind::Header, header.encode());
//! let bytes = frame.to_bytes().unwrap();
//!
//! let Decoded::Complete(decoded, used) = Frame::decode(&bytes).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(used, bytes.len());
//! assert_eq!(HeaderBlock::decode(&decoded.payload).unwrap().path, "/demo.Echo/Say");
//! ```

pub mod codec;
pub mod control;
mod error;
pub mod frame;
pub mod message;
pub mod varint;
pub mod wire;

pub use codec::{Codec, MAX_NESTING_DEPTH};
pub use control::{
    HeaderBlock, TrailerBlock, decode_credit, decode_status, encode_credit, encode_status,
};
pub use error::{CodecError, ProtocolError, ProtocolResult, VarintError};
pub use frame::{
    Decoded, Frame, FrameKind, FrameReader, FrameWriter, MAX_FRAME_OVERHEAD, MAX_FRAME_PAYLOAD,
    MAX_STREAM_ID, frame_len,
};
pub use message::{DynamicMessage, FieldValue, UnknownField, UnknownFields, Value};
