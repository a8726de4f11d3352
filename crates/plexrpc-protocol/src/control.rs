//! Payloads of the control frames.
//!
//! Control payloads use the same tag/value encoding as messages, with fixed
//! field numbers. Unknown fields are skipped so later revisions can add
//! entries.
//!
//! ```text
//! HEADER   1: path  2: timeout (microseconds)  3: metadata entry (repeated)
//! TRAILER  1: status code  2: status message  3: status details  4: metadata entry
//! CANCEL   1: status code  2: status message  3: status details
//! GOAWAY   1: status code  2: status message  3: status details
//! CREDIT   varint byte count
//! entry    1: key  2: text value | 3: binary value
//! ```

use std::time::Duration;

use plexrpc_core::{Code, Metadata, MetadataKey, MetadataValue, Status};

use crate::error::CodecError;
use crate::varint::{decode_varint, encode_varint};
use crate::wire::{FieldReader, RawValue, put_bytes_field, put_varint_field};

/// Contents of a HEADER frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBlock {
    /// Method path; empty on the server's response header.
    pub path: String,
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

impl HeaderBlock {
    pub fn request(path: impl Into<String>, timeout: Option<Duration>, metadata: Metadata) -> Self {
        Self {
            path: path.into(),
            timeout,
            metadata,
        }
    }

    pub fn response(metadata: Metadata) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.path.is_empty() {
            put_bytes_field(&mut out, 1, self.path.as_bytes());
        }
        if let Some(timeout) = self.timeout {
            // a zero timeout still has to be distinguishable from none
            let micros = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX).max(1);
            put_varint_field(&mut out, 2, micros);
        }
        encode_metadata(&self.metadata, 3, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut block = Self::default();
        for field in FieldReader::new(bytes) {
            let field = field?;
            match (field.number, field.value) {
                (1, RawValue::Bytes(b)) => block.path = utf8(b, "path")?,
                (2, RawValue::Varint(v)) => block.timeout = Some(Duration::from_micros(v)),
                (3, RawValue::Bytes(b)) => decode_entry(b, &mut block.metadata)?,
                (1..=3, _) => return Err(CodecError::wire(format!(
                    "header field {} has wire type {}",
                    field.number, field.wire_type
                ))),
                _ => {}
            }
        }
        Ok(block)
    }
}

/// Contents of a TRAILER frame.
///
/// A trailer without a status is a plain half-close of the sender's
/// direction. A trailer with a status also ends the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrailerBlock {
    pub status: Option<Status>,
    pub metadata: Metadata,
}

impl TrailerBlock {
    pub fn half_close() -> Self {
        Self::default()
    }

    pub fn with_status(status: Status, metadata: Metadata) -> Self {
        Self {
            status: Some(status),
            metadata,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(status) = &self.status {
            encode_status_fields(status, &mut out);
        }
        encode_metadata(&self.metadata, 4, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut parts = StatusParts::default();
        let mut metadata = Metadata::new();
        for field in FieldReader::new(bytes) {
            let field = field?;
            match (field.number, field.value) {
                (4, RawValue::Bytes(b)) => decode_entry(b, &mut metadata)?,
                (4, _) => return Err(CodecError::wire("trailer metadata must be length-delimited")),
                (number, value) => parts.accept(number, value)?,
            }
        }
        Ok(Self {
            status: parts.finish(),
            metadata,
        })
    }
}

/// Encodes the status carried by CANCEL and GOAWAY frames.
pub fn encode_status(status: &Status) -> Vec<u8> {
    let mut out = Vec::new();
    encode_status_fields(status, &mut out);
    out
}

/// Decodes a CANCEL or GOAWAY payload. An empty payload means `CANCELLED`.
pub fn decode_status(bytes: &[u8]) -> Result<Status, CodecError> {
    let mut parts = StatusParts::default();
    for field in FieldReader::new(bytes) {
        let field = field?;
        parts.accept(field.number, field.value)?;
    }
    Ok(parts
        .finish()
        .unwrap_or_else(|| Status::cancelled("cancelled by peer")))
}

pub fn encode_credit(bytes: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    encode_varint(u64::from(bytes), &mut out);
    out
}

pub fn decode_credit(payload: &[u8]) -> Result<u32, CodecError> {
    let (value, used) = decode_varint(payload)?;
    if used != payload.len() {
        return Err(CodecError::wire("trailing bytes after credit increment"));
    }
    u32::try_from(value).map_err(|_| CodecError::wire(format!("credit increment {value} overflows")))
}

fn encode_status_fields(status: &Status, out: &mut Vec<u8>) {
    put_varint_field(out, 1, u64::from(status.code().as_u32()));
    if !status.message().is_empty() {
        put_bytes_field(out, 2, status.message().as_bytes());
    }
    if let Some(details) = status.details() {
        put_bytes_field(out, 3, details);
    }
}

#[derive(Default)]
struct StatusParts {
    code: Option<Code>,
    message: String,
    details: Option<Vec<u8>>,
}

impl StatusParts {
    fn accept(&mut self, number: u32, value: RawValue<'_>) -> Result<(), CodecError> {
        match (number, value) {
            (1, RawValue::Varint(v)) => {
                let code = u32::try_from(v).map_err(|_| CodecError::wire("status code overflows"))?;
                self.code = Some(Code::from_u32(code));
            }
            (2, RawValue::Bytes(b)) => self.message = utf8(b, "status message")?,
            (3, RawValue::Bytes(b)) => self.details = Some(b.to_vec()),
            (1..=3, _) => {
                return Err(CodecError::wire(format!(
                    "status field {number} has the wrong wire type"
                )));
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(self) -> Option<Status> {
        let code = self.code?;
        let status = Status::new(code, self.message);
        Some(match self.details {
            Some(details) => status.with_details(details),
            None => status,
        })
    }
}

fn encode_metadata(metadata: &Metadata, number: u32, out: &mut Vec<u8>) {
    for (key, value) in metadata.iter() {
        let mut entry = Vec::new();
        put_bytes_field(&mut entry, 1, key.as_str().as_bytes());
        match value {
            MetadataValue::Text(text) => put_bytes_field(&mut entry, 2, text.as_bytes()),
            MetadataValue::Binary(bytes) => put_bytes_field(&mut entry, 3, bytes),
        }
        put_bytes_field(out, number, &entry);
    }
}

fn decode_entry(bytes: &[u8], metadata: &mut Metadata) -> Result<(), CodecError> {
    let mut key = None;
    let mut value = None;
    for field in FieldReader::new(bytes) {
        let field = field?;
        match (field.number, field.value) {
            (1, RawValue::Bytes(b)) => key = Some(utf8(b, "metadata key")?),
            (2, RawValue::Bytes(b)) => value = Some(MetadataValue::Text(utf8(b, "metadata value")?)),
            (3, RawValue::Bytes(b)) => value = Some(MetadataValue::Binary(b.to_vec())),
            _ => {}
        }
    }
    let key = key.ok_or_else(|| CodecError::wire("metadata entry without a key"))?;
    let key = MetadataKey::new(&key).map_err(|e| CodecError::wire(e.to_string()))?;
    metadata.push(key, value.unwrap_or(MetadataValue::Text(String::new())));
    Ok(())
}

fn utf8(bytes: &[u8], what: &str) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::wire(format!("{what} is not valid UTF-8")))
}
