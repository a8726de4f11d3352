//! The `plexrpc.demo.Echo` service.
//!
//! Descriptors are built by hand; the same registry serves both the
//! `serve` and `call` commands.

use std::sync::Arc;

use plexrpc_core::{CallPattern, DescriptorRegistry, FieldType, MessageDescriptor, Status};
use plexrpc_protocol::DynamicMessage;
use plexrpc_runtime::{LoggingInterceptor, Router, RuntimeResult};

use crate::cli::DemoMethod;
use crate::error::CliResult;

pub const SERVICE: &str = "plexrpc.demo.Echo";
pub const ECHO_REQUEST: &str = "plexrpc.demo.EchoRequest";
pub const ECHO_REPLY: &str = "plexrpc.demo.EchoReply";

/// Upper bound on `repeat` for `Expand`.
pub const MAX_REPEAT: u64 = 10_000;

impl DemoMethod {
    pub fn name(self) -> &'static str {
        match self {
            Self::Say => "Say",
            Self::Expand => "Expand",
            Self::Collect => "Collect",
            Self::Chat => "Chat",
        }
    }

    pub fn path(self) -> String {
        plexrpc_core::method_path(SERVICE, self.name())
    }

    pub fn pattern(self) -> CallPattern {
        match self {
            Self::Say => CallPattern::Unary,
            Self::Expand => CallPattern::ServerStreaming,
            Self::Collect => CallPattern::ClientStreaming,
            Self::Chat => CallPattern::Bidirectional,
        }
    }

    pub fn all() -> [Self; 4] {
        [Self::Say, Self::Expand, Self::Collect, Self::Chat]
    }
}

/// Descriptors of the echo service.
pub fn registry() -> CliResult<Arc<DescriptorRegistry>> {
    let request = MessageDescriptor::builder(ECHO_REQUEST)
        .field(1, "text", FieldType::String)
        .field(2, "repeat", FieldType::Uint32)
        .build()
        .map_err(config_error)?;
    let reply = MessageDescriptor::builder(ECHO_REPLY)
        .field(1, "text", FieldType::String)
        .field(2, "index", FieldType::Uint32)
        .build()
        .map_err(config_error)?;

    let builder = DemoMethod::all().into_iter().fold(
        DescriptorRegistry::builder().message(request).message(reply),
        |builder, method| {
            builder.method(SERVICE, method.name(), ECHO_REQUEST, ECHO_REPLY, method.pattern())
        },
    );
    Ok(Arc::new(builder.build().map_err(config_error)?))
}

fn config_error(err: impl std::fmt::Display) -> crate::error::CliError {
    crate::error::CliError::Config(format!("demo descriptors: {err}"))
}

fn message(registry: &DescriptorRegistry, name: &str) -> Result<DynamicMessage, Status> {
    registry
        .message(name)
        .map(|descriptor| DynamicMessage::new(descriptor.clone()))
        .ok_or_else(|| Status::internal(format!("{name} is not registered")))
}

/// Builds an `EchoRequest`.
pub fn request(
    registry: &DescriptorRegistry,
    text: &str,
    repeat: u32,
) -> Result<DynamicMessage, Status> {
    let mut request = message(registry, ECHO_REQUEST)?;
    request.set("text", text)?;
    request.set("repeat", repeat)?;
    Ok(request)
}

/// Builds an `EchoReply`.
pub fn reply(registry: &DescriptorRegistry, text: &str, index: u32) -> Result<DynamicMessage, Status> {
    let mut reply = message(registry, ECHO_REPLY)?;
    reply.set("text", text)?;
    reply.set("index", index)?;
    Ok(reply)
}

/// Router with all four echo handlers behind the logging interceptor.
pub fn router(registry: Arc<DescriptorRegistry>) -> RuntimeResult<Router> {
    let say = registry.clone();
    let expand = registry.clone();
    let collect = registry.clone();
    let chat = registry.clone();

    Router::builder(registry)
        .interceptor(LoggingInterceptor)
        .unary(&DemoMethod::Say.path(), move |request| {
            let registry = say.clone();
            async move { reply(&registry, request.message().get_str("text"), 0) }
        })
        .server_streaming(&DemoMethod::Expand.path(), move |request, sink| {
            let registry = expand.clone();
            async move {
                let repeat = request.message().get_u64("repeat");
                if repeat > MAX_REPEAT {
                    return Err(Status::invalid_argument(format!(
                        "repeat {repeat} exceeds {MAX_REPEAT}"
                    )));
                }
                let text = request.message().get_str("text");
                for index in 0..repeat as u32 {
                    sink.send(&reply(&registry, text, index)?).await?;
                }
                Ok(())
            }
        })
        .client_streaming(&DemoMethod::Collect.path(), move |mut requests| {
            let registry = collect.clone();
            async move {
                let mut texts = Vec::new();
                while let Some(request) = requests.message().await? {
                    texts.push(request.get_str("text").to_owned());
                }
                reply(&registry, &texts.join(" "), texts.len() as u32)
            }
        })
        .bidirectional(&DemoMethod::Chat.path(), move |mut requests, sink| {
            let registry = chat.clone();
            async move {
                let mut index = 0;
                while let Some(request) = requests.message().await? {
                    sink.send(&reply(&registry, request.get_str("text"), index)?)
                        .await?;
                    index += 1;
                }
                Ok::<_, Status>(())
            }
        })
        .build()
}
