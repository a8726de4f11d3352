//! `plexrpc call`.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use plexrpc_core::{DescriptorRegistry, Metadata};
use plexrpc_protocol::DynamicMessage;
use plexrpc_runtime::{CallOptions, Client, Streaming};

use crate::cli::DemoMethod;
use crate::config::CliConfig;
use crate::demo;
use crate::error::{CliError, CliResult};

/// One `EchoReply`, as printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub index: u32,
    pub text: String,
}

impl Reply {
    fn from_message(message: &DynamicMessage) -> Self {
        Self {
            index: u32::try_from(message.get_u64("index")).unwrap_or(u32::MAX),
            text: message.get_str("text").to_owned(),
        }
    }

    pub fn render(&self, json: bool) -> CliResult<String> {
        if json {
            serde_json::to_string(self)
                .map_err(|e| CliError::Config(format!("failed to serialize reply: {e}")))
        } else {
            Ok(format!("{}\t{}", self.index, self.text))
        }
    }
}

/// Arguments of `plexrpc call`.
#[derive(Debug, Clone)]
pub struct CallArgs {
    pub method: DemoMethod,
    pub texts: Vec<String>,
    pub repeat: u32,
    pub timeout_ms: Option<u64>,
    pub metadata: Vec<String>,
    pub json: bool,
}

impl CallArgs {
    pub fn options(&self) -> CliResult<CallOptions> {
        let mut options = CallOptions::new().with_metadata(parse_metadata(&self.metadata)?);
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        Ok(options)
    }
}

/// Parses `key=value` entries into request metadata.
pub fn parse_metadata(entries: &[String]) -> CliResult<Metadata> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| CliError::Usage(format!("metadata `{entry}` is not key=value")))?;
        metadata
            .append(key.trim(), value)
            .map_err(|e| CliError::Usage(format!("metadata `{entry}`: {e}")))?;
    }
    Ok(metadata)
}

/// Connects to the server socket and prints every reply.
pub async fn run(config: &CliConfig, socket_path: Option<&Path>, args: CallArgs) -> CliResult<()> {
    let registry = demo::registry()?;
    let path = config.socket_path(socket_path);
    let client = Client::connect_unix(&path, registry.clone(), config.connection_config()).await?;

    let replies = invoke(&client, &registry, &args).await;
    client.connection().close();
    client.connection().closed().await;
    for reply in replies? {
        println!("{}", reply.render(args.json)?);
    }
    Ok(())
}

/// Runs one call of the echo service and collects its replies.
pub async fn invoke(
    client: &Client,
    registry: &DescriptorRegistry,
    args: &CallArgs,
) -> CliResult<Vec<Reply>> {
    let options = args.options()?;
    let path = args.method.path();
    debug!(method = %path, texts = args.texts.len(), "calling");

    let replies = match args.method {
        DemoMethod::Say => {
            let text = args.texts.join(" ");
            let request = demo::request(registry, &text, 0)?;
            let response = client.unary(&path, &request, options).await?;
            vec![Reply::from_message(response.message())]
        }
        DemoMethod::Expand => {
            let text = args.texts.join(" ");
            let request = demo::request(registry, &text, args.repeat)?;
            let mut call = client.server_streaming(&path, &request, options).await?;
            drain(&mut call, Vec::new()).await?
        }
        DemoMethod::Collect => {
            let call = client.client_streaming(&path, options).await?;
            for text in &args.texts {
                call.send(&demo::request(registry, text, 0)?).await?;
            }
            let response = call.finish().await?;
            vec![Reply::from_message(response.message())]
        }
        DemoMethod::Chat => {
            let mut call = client.bidirectional(&path, options).await?;
            let mut replies = Vec::with_capacity(args.texts.len());
            for text in &args.texts {
                call.send(&demo::request(registry, text, 0)?).await?;
                if let Some(reply) = call.message().await? {
                    replies.push(Reply::from_message(&reply));
                }
            }
            call.close_send().await?;
            drain(&mut call, replies).await?
        }
    };
    Ok(replies)
}

async fn drain(call: &mut Streaming, mut replies: Vec<Reply>) -> CliResult<Vec<Reply>> {
    while let Some(reply) = call.message().await? {
        replies.push(Reply::from_message(&reply));
    }
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexrpc_core::Code;
    use plexrpc_runtime::{Connection, ConnectionConfig, Server};

    fn connect() -> (Client, std::sync::Arc<DescriptorRegistry>) {
        let registry = demo::registry().unwrap();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = Server::new(
            demo::router(registry.clone()).unwrap(),
            ConnectionConfig::default(),
        )
        .unwrap();
        tokio::spawn(async move { server.serve_connection(server_io).await });
        let client = Client::new(
            Connection::client(client_io, ConnectionConfig::default()),
            registry.clone(),
        );
        (client, registry)
    }

    fn args(method: DemoMethod, texts: &[&str]) -> CallArgs {
        CallArgs {
            method,
            texts: texts.iter().map(|t| t.to_string()).collect(),
            repeat: 3,
            timeout_ms: None,
            metadata: Vec::new(),
            json: false,
        }
    }

    fn rendered(replies: &[Reply]) -> Vec<String> {
        replies.iter().map(|r| r.render(false).unwrap()).collect()
    }

    #[tokio::test]
    async fn say_joins_texts() {
        let (client, registry) = connect();
        let replies = invoke(&client, &registry, &args(DemoMethod::Say, &["hello", "there"]))
            .await
            .unwrap();
        assert_eq!(rendered(&replies), ["0\thello there"]);
    }

    #[tokio::test]
    async fn expand_repeats() {
        let (client, registry) = connect();
        let replies = invoke(&client, &registry, &args(DemoMethod::Expand, &["ho"]))
            .await
            .unwrap();
        insta::assert_debug_snapshot!(rendered(&replies), @r#"
        [
            "0\tho",
            "1\tho",
            "2\tho",
        ]
        "#);
    }

    #[tokio::test]
    async fn collect_and_chat() {
        let (client, registry) = connect();
        let collected = invoke(&client, &registry, &args(DemoMethod::Collect, &["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(rendered(&collected), ["3\ta b c"]);

        let chat = invoke(&client, &registry, &args(DemoMethod::Chat, &["x", "y"]))
            .await
            .unwrap();
        assert_eq!(rendered(&chat), ["0\tx", "1\ty"]);
    }

    #[tokio::test]
    async fn expand_rejects_a_huge_repeat() {
        let (client, registry) = connect();
        let mut huge = args(DemoMethod::Expand, &["x"]);
        huge.repeat = 1_000_000;
        let err = invoke(&client, &registry, &huge).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::InvalidArgument));
    }

    #[test]
    fn renders_json_lines() {
        let reply = Reply {
            index: 2,
            text: "hi".into(),
        };
        assert_eq!(reply.render(true).unwrap(), r#"{"index":2,"text":"hi"}"#);
    }

    #[test]
    fn parses_metadata_entries() {
        let metadata =
            parse_metadata(&["x-user=ann".to_string(), "x-tag=a=b".to_string()]).unwrap();
        assert_eq!(metadata.get_text("x-user"), Some("ann"));
        assert_eq!(metadata.get_text("x-tag"), Some("a=b"));

        let err = parse_metadata(&["nokey".to_string()]).unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));
    }
}
