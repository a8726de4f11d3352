//! Schema-driven dynamic messages.
//!
//! A [`DynamicMessage`] pairs a [`MessageDescriptor`] with field values keyed
//! by field number. Singular scalar fields use implicit presence: setting a
//! field to its type's zero value clears it, so it is never encoded. Fields
//! the descriptor does not know about are kept as [`UnknownFields`] and
//! re-emitted unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use plexrpc_core::{FieldDescriptor, MessageDescriptor, WireType};

use crate::error::CodecError;

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Message(DynamicMessage),
}

impl Value {
    /// Whether this is the zero value of its kind. Messages are never zero.
    pub fn is_default(&self) -> bool {
        match self {
            Self::Bool(v) => !v,
            Self::I32(v) => *v == 0,
            Self::I64(v) => *v == 0,
            Self::U32(v) => *v == 0,
            Self::U64(v) => *v == 0,
            Self::F32(v) => v.to_bits() == 0,
            Self::F64(v) => v.to_bits() == 0,
            Self::String(v) => v.is_empty(),
            Self::Bytes(v) => v.is_empty(),
            Self::Message(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Message(_) => "message",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer value that fits in `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I32(v) => Some(i64::from(v)),
            Self::I64(v) => Some(v),
            Self::U32(v) => Some(i64::from(v)),
            Self::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Any non-negative integer value.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            Self::U32(v) => Some(u64::from(v)),
            Self::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(f64::from(v)),
            Self::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&DynamicMessage> {
        match self {
            Self::Message(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn is_integer(&self) -> bool {
        matches!(self, Self::I32(_) | Self::I64(_) | Self::U32(_) | Self::U64(_))
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::$variant(v.into())
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
    DynamicMessage => Message,
}

/// Stored contents of a known field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Single(Value),
    Repeated(Vec<Value>),
}

/// A field the descriptor did not recognize, kept byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownField {
    pub number: u32,
    pub wire_type: WireType,
    /// Encoded value bytes following the tag.
    pub raw: Vec<u8>,
}

/// Unknown fields in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnknownFields {
    fields: Vec<UnknownField>,
}

impl UnknownFields {
    pub fn push(&mut self, field: UnknownField) {
        self.fields.push(field);
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnknownField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

/// A message value described at runtime by a [`MessageDescriptor`].
#[derive(Debug, Clone)]
pub struct DynamicMessage {
    descriptor: Arc<MessageDescriptor>,
    fields: BTreeMap<u32, FieldValue>,
    unknown: UnknownFields,
}

impl PartialEq for DynamicMessage {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor.full_name() == other.descriptor.full_name()
            && self.fields == other.fields
            && self.unknown == other.unknown
    }
}

impl DynamicMessage {
    /// Creates an empty message; every field reads as its default.
    pub fn new(descriptor: Arc<MessageDescriptor>) -> Self {
        Self {
            descriptor,
            fields: BTreeMap::new(),
            unknown: UnknownFields::default(),
        }
    }

    pub fn descriptor(&self) -> &Arc<MessageDescriptor> {
        &self.descriptor
    }

    fn field(&self, name: &str) -> Result<&FieldDescriptor, CodecError> {
        self.descriptor
            .field_by_name(name)
            .ok_or_else(|| CodecError::UnknownField {
                message: self.descriptor.full_name().to_string(),
                field: name.to_string(),
            })
    }

    /// Sets a singular field. A zero scalar clears the field.
    ///
    /// Value kinds are checked against the field type when encoding.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), CodecError> {
        let field = self.field(name)?;
        if field.is_repeated() {
            return Err(CodecError::mismatch(format!(
                "{}.{name} is repeated; use push or set_repeated",
                self.descriptor.full_name()
            )));
        }
        let number = field.number();
        let value = value.into();
        if value.is_default() {
            self.fields.remove(&number);
        } else {
            self.fields.insert(number, FieldValue::Single(value));
        }
        Ok(())
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self, CodecError> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Appends to a repeated field.
    pub fn push(&mut self, name: &str, value: impl Into<Value>) -> Result<(), CodecError> {
        let number = self.repeated_number(name)?;
        self.append(number, value.into());
        Ok(())
    }

    /// Replaces the contents of a repeated field.
    pub fn set_repeated(&mut self, name: &str, values: Vec<Value>) -> Result<(), CodecError> {
        let number = self.repeated_number(name)?;
        if values.is_empty() {
            self.fields.remove(&number);
        } else {
            self.fields.insert(number, FieldValue::Repeated(values));
        }
        Ok(())
    }

    fn repeated_number(&self, name: &str) -> Result<u32, CodecError> {
        let field = self.field(name)?;
        if !field.is_repeated() {
            return Err(CodecError::mismatch(format!(
                "{}.{name} is not repeated",
                self.descriptor.full_name()
            )));
        }
        Ok(field.number())
    }

    /// Value of a singular field, or `None` if it holds its default.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let number = self.descriptor.field_by_name(name)?.number();
        match self.fields.get(&number)? {
            FieldValue::Single(value) => Some(value),
            FieldValue::Repeated(_) => None,
        }
    }

    /// Elements of a repeated field; empty if unset.
    pub fn get_repeated(&self, name: &str) -> &[Value] {
        let Some(field) = self.descriptor.field_by_name(name) else {
            return &[];
        };
        match self.fields.get(&field.number()) {
            Some(FieldValue::Repeated(values)) => values,
            _ => &[],
        }
    }

    /// String field contents, `""` when unset.
    pub fn get_str(&self, name: &str) -> &str {
        self.get(name).and_then(Value::as_str).unwrap_or_default()
    }

    /// Unsigned integer field contents, 0 when unset.
    pub fn get_u64(&self, name: &str) -> u64 {
        self.get(name).and_then(Value::as_u64).unwrap_or_default()
    }

    /// Signed integer field contents, 0 when unset.
    pub fn get_i64(&self, name: &str) -> i64 {
        self.get(name).and_then(Value::as_i64).unwrap_or_default()
    }

    pub fn clear(&mut self, name: &str) -> Result<(), CodecError> {
        let number = self.field(name)?.number();
        self.fields.remove(&number);
        Ok(())
    }

    pub fn get_by_number(&self, number: u32) -> Option<&FieldValue> {
        self.fields.get(&number)
    }

    /// Populated known fields in ascending number order.
    pub fn fields(&self) -> impl Iterator<Item = (u32, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (*n, v))
    }

    pub fn unknown_fields(&self) -> &UnknownFields {
        &self.unknown
    }

    pub fn unknown_fields_mut(&mut self) -> &mut UnknownFields {
        &mut self.unknown
    }

    /// True if no known or unknown field is populated.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.unknown.is_empty()
    }

    fn append(&mut self, number: u32, value: Value) {
        match self
            .fields
            .entry(number)
            .or_insert_with(|| FieldValue::Repeated(Vec::new()))
        {
            FieldValue::Repeated(values) => values.push(value),
            slot @ FieldValue::Single(_) => *slot = FieldValue::Repeated(vec![value]),
        }
    }

    pub(crate) fn insert_decoded(&mut self, field: &FieldDescriptor, value: Value) {
        let number = field.number();
        if field.is_repeated() {
            self.append(number, value);
        } else if value.is_default() {
            self.fields.remove(&number);
        } else {
            self.fields.insert(number, FieldValue::Single(value));
        }
    }
}
