//! End-to-end tests: a client and a server over an in-memory pipe.

mod frames;
mod scenarios;

use std::sync::Arc;

use plexrpc_core::{CallPattern, DescriptorRegistry, FieldType, MessageDescriptor, Status};
use plexrpc_protocol::DynamicMessage;

use crate::client::Client;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::dispatch::{Router, RouterBuilder, Server};

pub(crate) const SAY: &str = "/test.Echo/Say";
pub(crate) const EXPAND: &str = "/test.Echo/Expand";
pub(crate) const COLLECT: &str = "/test.Echo/Collect";
pub(crate) const CHAT: &str = "/test.Echo/Chat";
/// Declared in the registry but never routed.
pub(crate) const MISSING: &str = "/test.Echo/Missing";

pub(crate) fn registry() -> Arc<DescriptorRegistry> {
    let request = MessageDescriptor::builder("test.EchoRequest")
        .field(1, "text", FieldType::String)
        .field(2, "repeat", FieldType::Uint32)
        .build()
        .unwrap();
    let reply = MessageDescriptor::builder("test.EchoReply")
        .field(1, "text", FieldType::String)
        .field(2, "index", FieldType::Uint32)
        .build()
        .unwrap();
    let (req, rep) = ("test.EchoRequest", "test.EchoReply");
    Arc::new(
        DescriptorRegistry::builder()
            .message(request)
            .message(reply)
            .method("test.Echo", "Say", req, rep, CallPattern::Unary)
            .method("test.Echo", "Expand", req, rep, CallPattern::ServerStreaming)
            .method("test.Echo", "Collect", req, rep, CallPattern::ClientStreaming)
            .method("test.Echo", "Chat", req, rep, CallPattern::Bidirectional)
            .method("test.Echo", "Missing", req, rep, CallPattern::Unary)
            .build()
            .unwrap(),
    )
}

pub(crate) fn request(text: &str, repeat: u32) -> DynamicMessage {
    let descriptor = registry().message("test.EchoRequest").unwrap().clone();
    DynamicMessage::new(descriptor)
        .with("text", text)
        .unwrap()
        .with("repeat", repeat)
        .unwrap()
}

pub(crate) fn reply(text: &str, index: u32) -> Result<DynamicMessage, Status> {
    let descriptor = registry().message("test.EchoReply").unwrap().clone();
    let mut message = DynamicMessage::new(descriptor);
    message.set("text", text)?;
    message.set("index", index)?;
    Ok(message)
}

/// The echo service: Say echoes, Expand repeats, Collect joins, Chat
/// answers every message as it arrives.
pub(crate) fn echo_router() -> RouterBuilder {
    Router::builder(registry())
        .unary(SAY, |request| async move {
            reply(request.message().get_str("text"), 0)
        })
        .server_streaming(EXPAND, |request, sink| async move {
            let text = request.message().get_str("text");
            for index in 0..request.message().get_u64("repeat") as u32 {
                sink.send(&reply(text, index)?).await?;
            }
            Ok::<_, Status>(())
        })
        .client_streaming(COLLECT, |mut requests| async move {
            let mut parts = Vec::new();
            while let Some(message) = requests.message().await? {
                parts.push(message.get_str("text").to_owned());
            }
            reply(&parts.join(" "), parts.len() as u32)
        })
        .bidirectional(CHAT, |mut requests, sink| async move {
            let mut index = 0;
            while let Some(message) = requests.message().await? {
                sink.send(&reply(message.get_str("text"), index)?).await?;
                index += 1;
            }
            Ok::<_, Status>(())
        })
}

/// Serves `router` on one end of a pipe and returns a client on the other.
pub(crate) fn connect(router: Router, config: ConnectionConfig) -> Client {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = Server::new(router, config.clone()).unwrap();
    tokio::spawn(async move { server.serve_connection(server_io).await });
    Client::new(Connection::client(client_io, config), registry())
}

pub(crate) fn connect_echo() -> Client {
    connect(echo_router().build().unwrap(), ConnectionConfig::default())
}
