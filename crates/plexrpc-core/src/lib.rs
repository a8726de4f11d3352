//! Core types: status codes, metadata, descriptors, tracing setup.

pub mod descriptor;
pub mod metadata;
pub mod status;
pub mod tracing;

pub use descriptor::{
    Cardinality, CallPattern, DescriptorError, DescriptorRegistry, FieldDescriptor, FieldType,
    MessageDescriptor, MessageDescriptorBuilder, MethodDescriptor, RegistryBuilder, WireType,
    method_path,
};
pub use metadata::{Metadata, MetadataError, MetadataKey, MetadataValue};
pub use status::{Code, Status};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
