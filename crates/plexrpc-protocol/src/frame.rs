//! Multiplexed framing over a single ordered byte channel.
//!
//! Every frame carries the stream it belongs to, a kind byte and a
//! length-prefixed payload:
//!
//! ```text
//! +-------------------+--------+----------------+-----------------+
//! | stream id varint  | kind   | length varint  | payload         |
//! +-------------------+--------+----------------+-----------------+
//! ```
//!
//! Frames are written whole; the reader reassembles them from arbitrary
//! chunk boundaries.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult, VarintError};
use crate::varint::{decode_varint, encode_varint, varint_len};

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: u32 = 1024 * 1024;

/// Largest stream id; ids are never reused within a connection.
pub const MAX_STREAM_ID: u32 = u32::MAX;

/// Upper bound on the bytes a frame adds around its payload.
pub const MAX_FRAME_OVERHEAD: usize = 16;

/// Frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a call (client) or answers one (server): path, timeout, metadata.
    Header = 1,
    /// One encoded message.
    Message = 2,
    /// Closes the sender's direction; from a server it also carries the status.
    Trailer = 3,
    /// Abandons a call in both directions.
    Cancel = 4,
    /// Returns flow-control credit to the peer.
    Credit = 5,
    /// Announces that the connection is going away.
    GoAway = 6,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Header),
            2 => Some(Self::Message),
            3 => Some(Self::Trailer),
            4 => Some(Self::Cancel),
            5 => Some(Self::Credit),
            6 => Some(Self::GoAway),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Header => "HEADER",
            Self::Message => "MESSAGE",
            Self::Trailer => "TRAILER",
            Self::Cancel => "CANCEL",
            Self::Credit => "CREDIT",
            Self::GoAway => "GOAWAY",
        };
        f.write_str(name)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Result of trying to decode a frame from a buffer prefix.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A frame and the number of bytes it occupied.
    Complete(Frame, usize),
    /// More bytes are needed.
    Incomplete,
}

impl Frame {
    pub fn new(stream_id: u32, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind,
            payload,
        }
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        frame_len(self.stream_id, self.payload.len())
    }

    /// Appends the encoded frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> ProtocolResult<()> {
        let size = self.payload.len() as u64;
        if size > u64::from(MAX_FRAME_PAYLOAD) {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        out.reserve(self.encoded_len());
        encode_varint(u64::from(self.stream_id), out);
        out.push(self.kind as u8);
        encode_varint(size, out);
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Oversized length prefixes are rejected as soon as they are readable,
    /// before the payload arrives.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Decoded> {
        let (stream_id, mut pos) = match decode_varint(buf) {
            Ok(v) => v,
            Err(VarintError::Truncated) => return Ok(Decoded::Incomplete),
            Err(e) => return Err(ProtocolError::MalformedHeader(e)),
        };
        let stream_id =
            u32::try_from(stream_id).map_err(|_| ProtocolError::StreamIdOutOfRange(stream_id))?;

        let Some(&kind_byte) = buf.get(pos) else {
            return Ok(Decoded::Incomplete);
        };
        let kind = FrameKind::from_u8(kind_byte).ok_or(ProtocolError::UnknownFrameKind(kind_byte))?;
        pos += 1;

        let (len, len_bytes) = match decode_varint(&buf[pos..]) {
            Ok(v) => v,
            Err(VarintError::Truncated) => return Ok(Decoded::Incomplete),
            Err(e) => return Err(ProtocolError::MalformedHeader(e)),
        };
        if len > u64::from(MAX_FRAME_PAYLOAD) {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_PAYLOAD,
            });
        }
        pos += len_bytes;

        let end = pos + len as usize;
        if buf.len() < end {
            return Ok(Decoded::Incomplete);
        }
        Ok(Decoded::Complete(
            Frame::new(stream_id, kind, buf[pos..end].to_vec()),
            end,
        ))
    }
}

/// Encoded size of a frame with the given id and payload length.
///
/// This is also the flow-control cost of a MESSAGE frame.
pub fn frame_len(stream_id: u32, payload_len: usize) -> usize {
    varint_len(u64::from(stream_id)) + 1 + varint_len(payload_len as u64) + payload_len
}

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(8 * 1024),
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames, and
    /// [`ProtocolError::IncompleteFrame`] if the stream ends mid-frame.
    pub async fn read_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        loop {
            if let Decoded::Complete(frame, used) = Frame::decode(&self.buf)? {
                self.buf.drain(..used);
                return Ok(Some(frame));
            }
            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::IncompleteFrame {
                    received: self.buf.len(),
                });
            }
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> ProtocolResult<()> {
        let bytes = frame.to_bytes()?;
        self.write_encoded(&bytes).await
    }

    /// Writes one or more frames that were already encoded.
    pub async fn write_encoded(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }
}
