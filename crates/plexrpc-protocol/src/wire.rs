//! Tag/value level reading and writing, independent of any schema.

use plexrpc_core::WireType;
use plexrpc_core::descriptor::MAX_FIELD_NUMBER;

use crate::error::CodecError;
use crate::varint::{decode_varint, encode_varint};

pub fn encode_tag(number: u32, wire_type: WireType, out: &mut Vec<u8>) {
    encode_varint((u64::from(number) << 3) | u64::from(wire_type.as_u8()), out);
}

pub fn put_varint_field(out: &mut Vec<u8>, number: u32, value: u64) {
    encode_tag(number, WireType::Varint, out);
    encode_varint(value, out);
}

pub fn put_bytes_field(out: &mut Vec<u8>, number: u32, bytes: &[u8]) {
    encode_tag(number, WireType::LengthDelimited, out);
    encode_varint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

pub fn put_fixed32_field(out: &mut Vec<u8>, number: u32, value: u32) {
    encode_tag(number, WireType::Fixed32, out);
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_fixed64_field(out: &mut Vec<u8>, number: u32, value: u64) {
    encode_tag(number, WireType::Fixed64, out);
    out.extend_from_slice(&value.to_le_bytes());
}

/// A decoded value, borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Fixed32(u32),
    Bytes(&'a [u8]),
}

/// One tag/value pair as it appeared on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField<'a> {
    pub number: u32,
    pub wire_type: WireType,
    pub value: RawValue<'a>,
    /// Exact encoded value bytes following the tag (length prefix included).
    pub raw: &'a [u8],
}

/// Iterates the fields of an encoded message.
///
/// Yields at most one error, after which iteration stops.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_field(&mut self) -> Result<RawField<'a>, CodecError> {
        let rest = &self.buf[self.pos..];
        let (tag, tag_len) =
            decode_varint(rest).map_err(|e| CodecError::wire(format!("field tag: {e}")))?;
        let number = tag >> 3;
        if number == 0 || number > u64::from(MAX_FIELD_NUMBER) {
            return Err(CodecError::wire(format!("invalid field number {number}")));
        }
        let number = number as u32;
        let wire_bits = (tag & 0x7) as u8;
        let wire_type = WireType::from_u8(wire_bits).ok_or_else(|| {
            CodecError::wire(format!("field {number}: unsupported wire type {wire_bits}"))
        })?;

        let body = &rest[tag_len..];
        let truncated = || CodecError::wire(format!("field {number}: truncated value"));
        let (value, value_len) = match wire_type {
            WireType::Varint => {
                let (v, n) = decode_varint(body).map_err(|e| {
                    CodecError::wire(format!("field {number}: {e}"))
                })?;
                (RawValue::Varint(v), n)
            }
            WireType::Fixed64 => {
                let bytes: [u8; 8] = body
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(truncated)?;
                (RawValue::Fixed64(u64::from_le_bytes(bytes)), 8)
            }
            WireType::Fixed32 => {
                let bytes: [u8; 4] = body
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(truncated)?;
                (RawValue::Fixed32(u32::from_le_bytes(bytes)), 4)
            }
            WireType::LengthDelimited => {
                let (len, prefix) = decode_varint(body).map_err(|e| {
                    CodecError::wire(format!("field {number}: length {e}"))
                })?;
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| prefix.checked_add(len))
                    .filter(|&end| end <= body.len())
                    .ok_or_else(truncated)?;
                (RawValue::Bytes(&body[prefix..end]), end)
            }
        };

        self.pos += tag_len + value_len;
        Ok(RawField {
            number,
            wire_type,
            value,
            raw: &body[..value_len],
        })
    }
}

impl<'a> Iterator for FieldReader<'a> {
    type Item = Result<RawField<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let result = self.read_field();
        if result.is_err() {
            self.pos = self.buf.len();
        }
        Some(result)
    }
}
