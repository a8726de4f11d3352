//! Schema-driven message codec.
//!
//! Encoding is canonical: fields are written in ascending field-number order,
//! unknown fields are interleaved by number with their original bytes,
//! singular defaults are omitted and repeated scalars are written unpacked.
//! Decoding accepts fields in any order and repeated scalars in packed or
//! unpacked form.

use std::sync::Arc;

use plexrpc_core::{DescriptorRegistry, FieldDescriptor, FieldType, MessageDescriptor, WireType};

use crate::error::CodecError;
use crate::message::{DynamicMessage, FieldValue, UnknownField, Value};
use crate::varint::{
    decode_varint, encode_varint, zigzag_decode32, zigzag_decode64, zigzag_encode32,
    zigzag_encode64,
};
use crate::wire::{FieldReader, RawValue, encode_tag};

/// Deepest message nesting accepted in either direction.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Encodes and decodes [`DynamicMessage`]s against a descriptor registry.
#[derive(Debug, Clone)]
pub struct Codec {
    registry: Arc<DescriptorRegistry>,
}

impl Codec {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    /// Encodes `message`, which must be an instance of `descriptor`.
    pub fn encode(
        &self,
        message: &DynamicMessage,
        descriptor: &MessageDescriptor,
    ) -> Result<Vec<u8>, CodecError> {
        check_instance(message, descriptor)?;
        let mut out = Vec::new();
        encode_message(message, &mut out, 0)?;
        Ok(out)
    }

    /// Decodes `bytes` as an instance of `descriptor`.
    pub fn decode(
        &self,
        bytes: &[u8],
        descriptor: &Arc<MessageDescriptor>,
    ) -> Result<DynamicMessage, CodecError> {
        self.decode_message(bytes, descriptor, 0)
    }

    fn decode_message(
        &self,
        bytes: &[u8],
        descriptor: &Arc<MessageDescriptor>,
        depth: usize,
    ) -> Result<DynamicMessage, CodecError> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(CodecError::wire(format!(
                "message nesting exceeds {MAX_NESTING_DEPTH} levels"
            )));
        }
        let mut message = DynamicMessage::new(Arc::clone(descriptor));
        for raw in FieldReader::new(bytes) {
            let raw = raw?;
            let Some(field) = descriptor.field_by_number(raw.number) else {
                message.unknown_fields_mut().push(UnknownField {
                    number: raw.number,
                    wire_type: raw.wire_type,
                    raw: raw.raw.to_vec(),
                });
                continue;
            };

            match (raw.wire_type == field.wire_type(), raw.value) {
                (true, value) => {
                    let value = self.decode_value(field, value, depth)?;
                    message.insert_decoded(field, value);
                }
                (false, RawValue::Bytes(run))
                    if field.is_repeated() && field.field_type().is_packable() =>
                {
                    for value in unpack(field, run)? {
                        let value = self.decode_value(field, value, depth)?;
                        message.insert_decoded(field, value);
                    }
                }
                (false, _) => {
                    return Err(CodecError::mismatch(format!(
                        "{}.{} (field {}) expects {} but arrived as {}",
                        descriptor.full_name(),
                        field.name(),
                        field.number(),
                        field.wire_type(),
                        raw.wire_type
                    )));
                }
            }
        }
        Ok(message)
    }

    fn decode_value(
        &self,
        field: &FieldDescriptor,
        raw: RawValue<'_>,
        depth: usize,
    ) -> Result<Value, CodecError> {
        let out_of_range = |v: u64| {
            CodecError::wire(format!(
                "field {}: value {v} out of range for {}",
                field.number(),
                field.field_type()
            ))
        };
        let value = match (field.field_type(), raw) {
            (FieldType::Bool, RawValue::Varint(v)) => Value::Bool(v != 0),
            (FieldType::Int32, RawValue::Varint(v)) => {
                let wide = v as i64;
                Value::I32(i32::try_from(wide).map_err(|_| out_of_range(v))?)
            }
            (FieldType::Int64, RawValue::Varint(v)) => Value::I64(v as i64),
            (FieldType::Uint32, RawValue::Varint(v)) => {
                Value::U32(u32::try_from(v).map_err(|_| out_of_range(v))?)
            }
            (FieldType::Uint64, RawValue::Varint(v)) => Value::U64(v),
            (FieldType::Sint32, RawValue::Varint(v)) => {
                let narrow = u32::try_from(v).map_err(|_| out_of_range(v))?;
                Value::I32(zigzag_decode32(narrow))
            }
            (FieldType::Sint64, RawValue::Varint(v)) => Value::I64(zigzag_decode64(v)),
            (FieldType::Fixed32, RawValue::Fixed32(v)) => Value::U32(v),
            (FieldType::Sfixed32, RawValue::Fixed32(v)) => Value::I32(v as i32),
            (FieldType::Float, RawValue::Fixed32(v)) => Value::F32(f32::from_bits(v)),
            (FieldType::Fixed64, RawValue::Fixed64(v)) => Value::U64(v),
            (FieldType::Sfixed64, RawValue::Fixed64(v)) => Value::I64(v as i64),
            (FieldType::Double, RawValue::Fixed64(v)) => Value::F64(f64::from_bits(v)),
            (FieldType::String, RawValue::Bytes(b)) => {
                let text = std::str::from_utf8(b).map_err(|e| {
                    CodecError::wire(format!("field {}: invalid UTF-8: {e}", field.number()))
                })?;
                Value::String(text.to_string())
            }
            (FieldType::Bytes, RawValue::Bytes(b)) => Value::Bytes(b.to_vec()),
            (FieldType::Message(type_name), RawValue::Bytes(b)) => {
                let nested = self.registry.message(type_name).ok_or_else(|| {
                    CodecError::mismatch(format!("unknown message type {type_name}"))
                })?;
                Value::Message(self.decode_message(b, nested, depth + 1)?)
            }
            (ty, raw) => {
                return Err(CodecError::mismatch(format!(
                    "field {}: {ty} cannot hold {raw:?}",
                    field.number()
                )));
            }
        };
        Ok(value)
    }
}

fn check_instance(message: &DynamicMessage, descriptor: &MessageDescriptor) -> Result<(), CodecError> {
    if message.descriptor().full_name() != descriptor.full_name() {
        return Err(CodecError::mismatch(format!(
            "expected {} but message is {}",
            descriptor.full_name(),
            message.descriptor().full_name()
        )));
    }
    Ok(())
}

/// Splits a packed run into individual values of the field's wire type.
fn unpack<'a>(field: &FieldDescriptor, mut run: &'a [u8]) -> Result<Vec<RawValue<'a>>, CodecError> {
    let mut values = Vec::new();
    match field.wire_type() {
        WireType::Varint => {
            while !run.is_empty() {
                let (v, n) = decode_varint(run).map_err(|e| {
                    CodecError::wire(format!("field {}: packed {e}", field.number()))
                })?;
                values.push(RawValue::Varint(v));
                run = &run[n..];
            }
        }
        WireType::Fixed32 => {
            for chunk in fixed_chunks(field, run, 4)? {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(chunk);
                values.push(RawValue::Fixed32(u32::from_le_bytes(bytes)));
            }
        }
        WireType::Fixed64 => {
            for chunk in fixed_chunks(field, run, 8)? {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                values.push(RawValue::Fixed64(u64::from_le_bytes(bytes)));
            }
        }
        WireType::LengthDelimited => {
            return Err(CodecError::mismatch(format!(
                "field {} cannot be packed",
                field.number()
            )));
        }
    }
    Ok(values)
}

fn fixed_chunks<'a>(
    field: &FieldDescriptor,
    run: &'a [u8],
    width: usize,
) -> Result<std::slice::ChunksExact<'a, u8>, CodecError> {
    if run.len() % width != 0 {
        return Err(CodecError::wire(format!(
            "field {}: packed run of {} bytes is not a multiple of {width}",
            field.number(),
            run.len()
        )));
    }
    Ok(run.chunks_exact(width))
}

fn encode_message(message: &DynamicMessage, out: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(CodecError::wire(format!(
            "message nesting exceeds {MAX_NESTING_DEPTH} levels"
        )));
    }
    let descriptor = message.descriptor();

    let mut unknown: Vec<&UnknownField> = message.unknown_fields().iter().collect();
    unknown.sort_by_key(|f| f.number);
    let mut unknown = unknown.into_iter().peekable();

    for (number, stored) in message.fields() {
        while let Some(field) = unknown.next_if(|f| f.number < number) {
            write_unknown(field, out);
        }
        let field = descriptor.field_by_number(number).ok_or_else(|| {
            CodecError::mismatch(format!("{} has no field {number}", descriptor.full_name()))
        })?;
        match stored {
            FieldValue::Single(value) if !value.is_default() => {
                encode_field(field, value, out, depth)?;
            }
            FieldValue::Single(_) => {}
            FieldValue::Repeated(values) => {
                if !field.is_repeated() {
                    return Err(CodecError::mismatch(format!(
                        "{}.{} is not repeated",
                        descriptor.full_name(),
                        field.name()
                    )));
                }
                for value in values {
                    encode_field(field, value, out, depth)?;
                }
            }
        }
    }
    for field in unknown {
        write_unknown(field, out);
    }
    Ok(())
}

fn write_unknown(field: &UnknownField, out: &mut Vec<u8>) {
    encode_tag(field.number, field.wire_type, out);
    out.extend_from_slice(&field.raw);
}

fn encode_field(
    field: &FieldDescriptor,
    value: &Value,
    out: &mut Vec<u8>,
    depth: usize,
) -> Result<(), CodecError> {
    let number = field.number();
    let mismatch = || {
        CodecError::mismatch(format!(
            "field {number} ({}) cannot hold a {} value",
            field.field_type(),
            value.kind()
        ))
    };
    let too_wide = || {
        CodecError::wire(format!(
            "field {number}: {value:?} does not fit {}",
            field.field_type()
        ))
    };
    let signed = || -> Result<i64, CodecError> {
        if !value.is_integer() {
            return Err(mismatch());
        }
        value.as_i64().ok_or_else(too_wide)
    };
    let unsigned = || -> Result<u64, CodecError> {
        if !value.is_integer() {
            return Err(mismatch());
        }
        value.as_u64().ok_or_else(too_wide)
    };
    let signed32 = || -> Result<i32, CodecError> {
        i32::try_from(signed()?).map_err(|_| too_wide())
    };
    let unsigned32 = || -> Result<u32, CodecError> {
        u32::try_from(unsigned()?).map_err(|_| too_wide())
    };

    encode_tag(number, field.wire_type(), out);
    match field.field_type() {
        FieldType::Bool => {
            let v = value.as_bool().ok_or_else(mismatch)?;
            encode_varint(u64::from(v), out);
        }
        FieldType::Int32 => encode_varint(i64::from(signed32()?) as u64, out),
        FieldType::Int64 => encode_varint(signed()? as u64, out),
        FieldType::Uint32 => encode_varint(u64::from(unsigned32()?), out),
        FieldType::Uint64 => encode_varint(unsigned()?, out),
        FieldType::Sint32 => encode_varint(u64::from(zigzag_encode32(signed32()?)), out),
        FieldType::Sint64 => encode_varint(zigzag_encode64(signed()?), out),
        FieldType::Fixed32 => out.extend_from_slice(&unsigned32()?.to_le_bytes()),
        FieldType::Sfixed32 => out.extend_from_slice(&signed32()?.to_le_bytes()),
        FieldType::Fixed64 => out.extend_from_slice(&unsigned()?.to_le_bytes()),
        FieldType::Sfixed64 => out.extend_from_slice(&signed()?.to_le_bytes()),
        FieldType::Float => {
            let v = match *value {
                Value::F32(v) => v,
                Value::F64(v) if !v.is_finite() || f64::from(v as f32) == v => v as f32,
                Value::F64(_) => return Err(too_wide()),
                _ => return Err(mismatch()),
            };
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        FieldType::Double => {
            let v = value.as_f64().ok_or_else(mismatch)?;
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        FieldType::String => {
            let v = value.as_str().ok_or_else(mismatch)?;
            encode_varint(v.len() as u64, out);
            out.extend_from_slice(v.as_bytes());
        }
        FieldType::Bytes => {
            let v = value.as_bytes().ok_or_else(mismatch)?;
            encode_varint(v.len() as u64, out);
            out.extend_from_slice(v);
        }
        FieldType::Message(type_name) => {
            let nested = value.as_message().ok_or_else(mismatch)?;
            if nested.descriptor().full_name() != type_name {
                return Err(CodecError::mismatch(format!(
                    "field {number} expects {type_name} but got {}",
                    nested.descriptor().full_name()
                )));
            }
            let mut body = Vec::new();
            encode_message(nested, &mut body, depth + 1)?;
            encode_varint(body.len() as u64, out);
            out.extend_from_slice(&body);
        }
    }
    Ok(())
}
