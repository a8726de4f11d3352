//! Compiled, immutable schema descriptors and the registry that holds them.
//!
//! Descriptors are produced once (by an external schema compiler or by hand)
//! and never change afterwards. The [`DescriptorRegistry`] is passed
//! explicitly to the codec and to server dispatch; there is no global
//! registry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use thiserror::Error;

/// Largest field number a tag can carry.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Field numbers reserved for the implementation; never valid in a schema.
pub const IMPLEMENTATION_RESERVED: RangeInclusive<u32> = 19_000..=19_999;

/// Errors raised while building descriptors or checking schema evolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("{message}: field number {number} is out of range")]
    InvalidFieldNumber { message: String, number: u32 },

    #[error("{message}: field number {number} is used twice")]
    DuplicateFieldNumber { message: String, number: u32 },

    #[error("{message}: field name {name:?} is used twice")]
    DuplicateFieldName { message: String, name: String },

    #[error("{message}: field number {number} is reserved")]
    ReservedFieldNumber { message: String, number: u32 },

    #[error("{message}: field number {number} was removed without being reserved")]
    FieldNumberDropped { message: String, number: u32 },

    #[error("{message}: field number {number} changed type from {from} to {to}")]
    FieldNumberReused {
        message: String,
        number: u32,
        from: FieldType,
        to: FieldType,
    },

    #[error("duplicate message descriptor {0}")]
    DuplicateMessage(String),

    #[error("duplicate method {0}")]
    DuplicateMethod(String),

    #[error("{context} refers to unknown message {type_name}")]
    UnresolvedType { context: String, type_name: String },

    #[error("descriptor name is empty")]
    EmptyName,
}

/// Encoding of a value on the wire, carried in the low three bits of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    /// Parses the low three bits of a tag. Group wire types are unsupported.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Varint),
            1 => Some(Self::Fixed64),
            2 => Some(Self::LengthDelimited),
            5 => Some(Self::Fixed32),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Varint => "varint",
            Self::Fixed64 => "fixed64",
            Self::LengthDelimited => "length-delimited",
            Self::Fixed32 => "fixed32",
        };
        f.write_str(name)
    }
}

/// Declared type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    String,
    Bytes,
    /// Nested message, by fully qualified name.
    Message(String),
}

impl FieldType {
    pub fn wire_type(&self) -> WireType {
        match self {
            Self::Bool
            | Self::Int32
            | Self::Int64
            | Self::Uint32
            | Self::Uint64
            | Self::Sint32
            | Self::Sint64 => WireType::Varint,
            Self::Fixed64 | Self::Sfixed64 | Self::Double => WireType::Fixed64,
            Self::Fixed32 | Self::Sfixed32 | Self::Float => WireType::Fixed32,
            Self::String | Self::Bytes | Self::Message(_) => WireType::LengthDelimited,
        }
    }

    /// Scalar numeric types may also arrive packed into one length-delimited run.
    pub fn is_packable(&self) -> bool {
        self.wire_type() != WireType::LengthDelimited
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Sint32 => "sint32",
            Self::Sint64 => "sint64",
            Self::Fixed32 => "fixed32",
            Self::Fixed64 => "fixed64",
            Self::Sfixed32 => "sfixed32",
            Self::Sfixed64 => "sfixed64",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Message(name) => return write!(f, "message {name}"),
        };
        f.write_str(name)
    }
}

/// Whether a field holds at most one value or a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    Optional,
    Repeated,
}

/// One field of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    number: u32,
    name: String,
    ty: FieldType,
    cardinality: Cardinality,
}

impl FieldDescriptor {
    pub fn new(number: u32, name: impl Into<String>, ty: FieldType, cardinality: Cardinality) -> Self {
        Self {
            number,
            name: name.into(),
            ty,
            cardinality,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> &FieldType {
        &self.ty
    }

    pub fn wire_type(&self) -> WireType {
        self.ty.wire_type()
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn is_repeated(&self) -> bool {
        self.cardinality == Cardinality::Repeated
    }
}

/// A message schema: fields ordered by ascending number plus reserved numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    full_name: String,
    fields: Vec<FieldDescriptor>,
    reserved: BTreeSet<u32>,
}

impl MessageDescriptor {
    pub fn builder(full_name: impl Into<String>) -> MessageDescriptorBuilder {
        MessageDescriptorBuilder {
            full_name: full_name.into(),
            fields: Vec::new(),
            reserved: BTreeSet::new(),
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Fields in canonical (ascending number) order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields
            .binary_search_by_key(&number, FieldDescriptor::number)
            .ok()
            .map(|idx| &self.fields[idx])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_reserved(&self, number: u32) -> bool {
        self.reserved.contains(&number)
    }

    /// Checks that `next` is a legal successor of this descriptor.
    ///
    /// A published field number must keep its declared type, or be reserved
    /// in `next` if the field is removed. Numbers reserved here stay unused.
    /// Types sharing a wire type still decode differently (`int32` against
    /// `sint32`), so only an identical type counts.
    pub fn check_evolution(&self, next: &MessageDescriptor) -> Result<(), DescriptorError> {
        for field in &self.fields {
            match next.field_by_number(field.number) {
                Some(successor) if successor.field_type() != field.field_type() => {
                    return Err(DescriptorError::FieldNumberReused {
                        message: self.full_name.clone(),
                        number: field.number,
                        from: field.field_type().clone(),
                        to: successor.field_type().clone(),
                    });
                }
                Some(_) => {}
                None if next.is_reserved(field.number) => {}
                None => {
                    return Err(DescriptorError::FieldNumberDropped {
                        message: self.full_name.clone(),
                        number: field.number,
                    });
                }
            }
        }
        for &number in &self.reserved {
            if next.field_by_number(number).is_some() {
                return Err(DescriptorError::ReservedFieldNumber {
                    message: self.full_name.clone(),
                    number,
                });
            }
        }
        Ok(())
    }
}

/// Builder for [`MessageDescriptor`].
#[derive(Debug, Clone)]
pub struct MessageDescriptorBuilder {
    full_name: String,
    fields: Vec<FieldDescriptor>,
    reserved: BTreeSet<u32>,
}

impl MessageDescriptorBuilder {
    /// Adds a singular field.
    #[must_use]
    pub fn field(mut self, number: u32, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields
            .push(FieldDescriptor::new(number, name, ty, Cardinality::Optional));
        self
    }

    /// Adds a repeated field.
    #[must_use]
    pub fn repeated(mut self, number: u32, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields
            .push(FieldDescriptor::new(number, name, ty, Cardinality::Repeated));
        self
    }

    /// Reserves a field number (typically one that was removed).
    #[must_use]
    pub fn reserved(mut self, number: u32) -> Self {
        self.reserved.insert(number);
        self
    }

    #[must_use]
    pub fn reserved_range(mut self, range: RangeInclusive<u32>) -> Self {
        self.reserved.extend(range);
        self
    }

    pub fn build(mut self) -> Result<MessageDescriptor, DescriptorError> {
        if self.full_name.is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        let mut names = HashSet::new();
        for field in &self.fields {
            if field.number == 0
                || field.number > MAX_FIELD_NUMBER
                || IMPLEMENTATION_RESERVED.contains(&field.number)
            {
                return Err(DescriptorError::InvalidFieldNumber {
                    message: self.full_name,
                    number: field.number,
                });
            }
            if self.reserved.contains(&field.number) {
                return Err(DescriptorError::ReservedFieldNumber {
                    message: self.full_name,
                    number: field.number,
                });
            }
            if !names.insert(field.name.clone()) {
                return Err(DescriptorError::DuplicateFieldName {
                    message: self.full_name,
                    name: field.name.clone(),
                });
            }
        }

        self.fields.sort_by_key(FieldDescriptor::number);
        if let Some(pair) = self.fields.windows(2).find(|w| w[0].number == w[1].number) {
            return Err(DescriptorError::DuplicateFieldNumber {
                message: self.full_name,
                number: pair[0].number,
            });
        }

        Ok(MessageDescriptor {
            full_name: self.full_name,
            fields: self.fields,
            reserved: self.reserved,
        })
    }
}

/// Message cardinality pattern of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPattern {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Bidirectional,
}

impl CallPattern {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => Self::Unary,
            (false, true) => Self::ServerStreaming,
            (true, false) => Self::ClientStreaming,
            (true, true) => Self::Bidirectional,
        }
    }

    pub fn client_streaming(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Bidirectional)
    }

    pub fn server_streaming(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Bidirectional)
    }
}

impl fmt::Display for CallPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

/// A resolved RPC method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    service: String,
    name: String,
    path: String,
    input: Arc<MessageDescriptor>,
    output: Arc<MessageDescriptor>,
    client_streaming: bool,
    server_streaming: bool,
}

impl MethodDescriptor {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch key, `/<service>/<method>`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn input(&self) -> &Arc<MessageDescriptor> {
        &self.input
    }

    pub fn output(&self) -> &Arc<MessageDescriptor> {
        &self.output
    }

    pub fn client_streaming(&self) -> bool {
        self.client_streaming
    }

    pub fn server_streaming(&self) -> bool {
        self.server_streaming
    }

    pub fn pattern(&self) -> CallPattern {
        CallPattern::from_flags(self.client_streaming, self.server_streaming)
    }
}

/// Builds a method path from service and method names.
pub fn method_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Immutable set of message and method descriptors.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    messages: HashMap<String, Arc<MessageDescriptor>>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl DescriptorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn message(&self, full_name: &str) -> Option<&Arc<MessageDescriptor>> {
        self.messages.get(full_name)
    }

    /// Looks up a method by its `/<service>/<method>` path.
    pub fn method(&self, path: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(path)
    }

    /// All methods, sorted by path.
    pub fn methods(&self) -> Vec<&Arc<MethodDescriptor>> {
        let mut methods: Vec<_> = self.methods.values().collect();
        methods.sort_by(|a, b| a.path.cmp(&b.path));
        methods
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[derive(Debug, Clone)]
struct MethodDef {
    service: String,
    name: String,
    input: String,
    output: String,
    pattern: CallPattern,
}

/// Collects descriptors and resolves cross references into a registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    messages: Vec<MessageDescriptor>,
    methods: Vec<MethodDef>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn message(mut self, descriptor: MessageDescriptor) -> Self {
        self.messages.push(descriptor);
        self
    }

    /// Declares a method; `input` and `output` are message full names.
    #[must_use]
    pub fn method(
        mut self,
        service: impl Into<String>,
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        pattern: CallPattern,
    ) -> Self {
        self.methods.push(MethodDef {
            service: service.into(),
            name: name.into(),
            input: input.into(),
            output: output.into(),
            pattern,
        });
        self
    }

    pub fn build(self) -> Result<DescriptorRegistry, DescriptorError> {
        let mut messages = HashMap::new();
        for descriptor in self.messages {
            let name = descriptor.full_name.clone();
            if messages.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(DescriptorError::DuplicateMessage(name));
            }
        }

        for descriptor in messages.values() {
            for field in &descriptor.fields {
                if let FieldType::Message(type_name) = &field.ty
                    && !messages.contains_key(type_name)
                {
                    return Err(DescriptorError::UnresolvedType {
                        context: format!("{}.{}", descriptor.full_name, field.name),
                        type_name: type_name.clone(),
                    });
                }
            }
        }

        let resolve = |context: &str, type_name: &str| {
            messages
                .get(type_name)
                .cloned()
                .ok_or_else(|| DescriptorError::UnresolvedType {
                    context: context.to_string(),
                    type_name: type_name.to_string(),
                })
        };

        let mut methods = HashMap::new();
        for def in self.methods {
            if def.service.is_empty() || def.name.is_empty() {
                return Err(DescriptorError::EmptyName);
            }
            let path = method_path(&def.service, &def.name);
            let method = MethodDescriptor {
                input: resolve(&path, &def.input)?,
                output: resolve(&path, &def.output)?,
                client_streaming: def.pattern.client_streaming(),
                server_streaming: def.pattern.server_streaming(),
                service: def.service,
                name: def.name,
                path: path.clone(),
            };
            if methods.insert(path.clone(), Arc::new(method)).is_some() {
                return Err(DescriptorError::DuplicateMethod(path));
            }
        }

        Ok(DescriptorRegistry { messages, methods })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> MessageDescriptor {
        MessageDescriptor::builder("geo.Point")
            .field(2, "y", FieldType::Sint32)
            .field(1, "x", FieldType::Sint32)
            .repeated(3, "tags", FieldType::String)
            .build()
            .unwrap()
    }

    #[test]
    fn fields_sorted_by_number() {
        let desc = point();
        let numbers: Vec<_> = desc.fields().iter().map(FieldDescriptor::number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(desc.field_by_name("y").unwrap().number(), 2);
        assert!(desc.field_by_number(3).unwrap().is_repeated());
        assert!(desc.field_by_number(4).is_none());
    }

    #[test]
    fn wire_types_follow_field_types() {
        assert_eq!(FieldType::Sint64.wire_type(), WireType::Varint);
        assert_eq!(FieldType::Double.wire_type(), WireType::Fixed64);
        assert_eq!(FieldType::Float.wire_type(), WireType::Fixed32);
        assert_eq!(
            FieldType::Message("a.B".into()).wire_type(),
            WireType::LengthDelimited
        );
        assert!(!FieldType::Bytes.is_packable());
        assert!(FieldType::Bool.is_packable());
    }

    #[test]
    fn rejects_invalid_numbers() {
        for number in [0, MAX_FIELD_NUMBER + 1, 19_500] {
            let err = MessageDescriptor::builder("m.M")
                .field(number, "f", FieldType::Bool)
                .build()
                .unwrap_err();
            assert!(matches!(err, DescriptorError::InvalidFieldNumber { .. }));
        }
    }

    #[test]
    fn rejects_duplicates_and_reserved() {
        let dup = MessageDescriptor::builder("m.M")
            .field(1, "a", FieldType::Bool)
            .field(1, "b", FieldType::Bool)
            .build();
        assert!(matches!(
            dup,
            Err(DescriptorError::DuplicateFieldNumber { number: 1, .. })
        ));

        let dup_name = MessageDescriptor::builder("m.M")
            .field(1, "a", FieldType::Bool)
            .field(2, "a", FieldType::Bool)
            .build();
        assert!(matches!(
            dup_name,
            Err(DescriptorError::DuplicateFieldName { .. })
        ));

        let reserved = MessageDescriptor::builder("m.M")
            .reserved_range(4..=6)
            .field(5, "a", FieldType::Bool)
            .build();
        assert!(matches!(
            reserved,
            Err(DescriptorError::ReservedFieldNumber { number: 5, .. })
        ));
    }

    #[test]
    fn evolution_requires_reservation() {
        let v1 = point();

        let dropped = MessageDescriptor::builder("geo.Point")
            .field(1, "x", FieldType::Sint32)
            .repeated(3, "tags", FieldType::String)
            .build()
            .unwrap();
        assert!(matches!(
            v1.check_evolution(&dropped),
            Err(DescriptorError::FieldNumberDropped { number: 2, .. })
        ));

        let reserved = MessageDescriptor::builder("geo.Point")
            .field(1, "x", FieldType::Sint32)
            .repeated(3, "tags", FieldType::String)
            .field(4, "z", FieldType::Sint32)
            .reserved(2)
            .build()
            .unwrap();
        assert!(v1.check_evolution(&reserved).is_ok());

        let reused = MessageDescriptor::builder("geo.Point")
            .field(1, "x", FieldType::Sint32)
            .field(2, "label", FieldType::String)
            .repeated(3, "tags", FieldType::String)
            .build()
            .unwrap();
        assert!(matches!(
            v1.check_evolution(&reused),
            Err(DescriptorError::FieldNumberReused { number: 2, .. })
        ));

        let revived = MessageDescriptor::builder("geo.Point")
            .field(1, "x", FieldType::Sint32)
            .field(2, "y", FieldType::Sint32)
            .repeated(3, "tags", FieldType::String)
            .field(4, "z", FieldType::Sint32)
            .build()
            .unwrap();
        assert!(matches!(
            reserved.check_evolution(&revived),
            Err(DescriptorError::ReservedFieldNumber { number: 2, .. })
        ));
    }

    #[test]
    fn evolution_rejects_a_retype_on_the_same_wire_type() {
        let v1 = point();
        let retyped = MessageDescriptor::builder("geo.Point")
            .field(1, "x", FieldType::Sint32)
            .field(2, "y", FieldType::Int32)
            .repeated(3, "tags", FieldType::String)
            .build()
            .unwrap();
        let err = v1.check_evolution(&retyped).unwrap_err();
        assert_eq!(
            err.to_string(),
            "geo.Point: field number 2 changed type from sint32 to int32"
        );

        let renamed = MessageDescriptor::builder("geo.Point")
            .field(1, "x", FieldType::Sint32)
            .field(2, "lat", FieldType::Sint32)
            .repeated(3, "tags", FieldType::String)
            .build()
            .unwrap();
        assert!(v1.check_evolution(&renamed).is_ok());
    }

    #[test]
    fn registry_resolves_methods() {
        let registry = DescriptorRegistry::builder()
            .message(point())
            .message(
                MessageDescriptor::builder("geo.Route")
                    .repeated(1, "points", FieldType::Message("geo.Point".into()))
                    .build()
                    .unwrap(),
            )
            .method("geo.Router", "Trace", "geo.Point", "geo.Route", CallPattern::ClientStreaming)
            .build()
            .unwrap();

        let method = registry.method("/geo.Router/Trace").unwrap();
        assert_eq!(method.pattern(), CallPattern::ClientStreaming);
        assert!(method.client_streaming());
        assert!(!method.server_streaming());
        assert_eq!(method.input().full_name(), "geo.Point");
        assert_eq!(method.output().full_name(), "geo.Route");
        assert_eq!(registry.methods().len(), 1);
        assert_eq!(registry.message_count(), 2);
    }

    #[test]
    fn registry_rejects_unresolved_references() {
        let err = DescriptorRegistry::builder()
            .message(
                MessageDescriptor::builder("a.Outer")
                    .field(1, "inner", FieldType::Message("a.Missing".into()))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, DescriptorError::UnresolvedType { .. }));

        let err = DescriptorRegistry::builder()
            .message(point())
            .method("geo.Router", "Get", "geo.Point", "geo.Nope", CallPattern::Unary)
            .build()
            .unwrap_err();
        assert!(matches!(err, DescriptorError::UnresolvedType { .. }));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let err = DescriptorRegistry::builder()
            .message(point())
            .message(point())
            .build()
            .unwrap_err();
        assert_eq!(err, DescriptorError::DuplicateMessage("geo.Point".into()));

        let err = DescriptorRegistry::builder()
            .message(point())
            .method("s", "M", "geo.Point", "geo.Point", CallPattern::Unary)
            .method("s", "M", "geo.Point", "geo.Point", CallPattern::Bidirectional)
            .build()
            .unwrap_err();
        assert_eq!(err, DescriptorError::DuplicateMethod("/s/M".into()));
    }

    #[test]
    fn pattern_flags() {
        assert_eq!(CallPattern::from_flags(false, false), CallPattern::Unary);
        assert_eq!(CallPattern::from_flags(true, true), CallPattern::Bidirectional);
        assert!(CallPattern::ServerStreaming.server_streaming());
        assert!(!CallPattern::ServerStreaming.client_streaming());
    }
}
