//! Typed client calls over one [`Connection`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use plexrpc_core::{CallPattern, DescriptorRegistry, Metadata, MethodDescriptor, Status};
use plexrpc_protocol::{Codec, DynamicMessage};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::call::Side;
use crate::config::ConnectionConfig;
use crate::connection::{CallHandle, Completion, Connection};
use crate::deadline::{CancelSignal, deadline_after, earliest};
use crate::error::RuntimeResult;
use crate::interceptor::{CallContext, Interceptor, Terminal, run_chain, terminal};

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative timeout, measured from when the options are used.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Effective deadline: the earlier of the timeout and the absolute one.
    pub fn deadline(&self) -> Option<Instant> {
        earliest(self.deadline, self.timeout.map(deadline_after))
    }
}

/// A completed call's single response.
#[derive(Debug, Clone)]
pub struct Response {
    message: DynamicMessage,
    headers: Metadata,
    trailers: Metadata,
}

impl Response {
    pub fn message(&self) -> &DynamicMessage {
        &self.message
    }

    pub fn into_message(self) -> DynamicMessage {
        self.message
    }

    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }
}

/// Client stub. Clones share the connection and interceptors.
#[derive(Clone)]
pub struct Client {
    connection: Connection,
    registry: Arc<DescriptorRegistry>,
    codec: Codec,
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl Client {
    pub fn new(connection: Connection, registry: Arc<DescriptorRegistry>) -> Self {
        Self {
            connection,
            codec: Codec::new(registry.clone()),
            registry,
            interceptors: Arc::new(Vec::new()),
        }
    }

    /// Dials a server on a Unix socket.
    #[cfg(unix)]
    pub async fn connect_unix(
        path: impl AsRef<Path>,
        registry: Arc<DescriptorRegistry>,
        config: ConnectionConfig,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        let stream = tokio::net::UnixStream::connect(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "connected");
        Ok(Self::new(Connection::client(stream, config), registry))
    }

    /// Adds a client interceptor. The first one added is the outermost.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        Arc::make_mut(&mut self.interceptors).push(Arc::new(interceptor));
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn method(&self, path: &str, pattern: CallPattern) -> Result<Arc<MethodDescriptor>, Status> {
        let method = self
            .registry
            .method(path)
            .ok_or_else(|| Status::unimplemented(format!("unknown method {path}")))?;
        if method.pattern() != pattern {
            return Err(Status::invalid_argument(format!(
                "{path} is {}, not {pattern}",
                method.pattern()
            )));
        }
        Ok(method.clone())
    }

    fn context(&self, path: &str, options: &CallOptions) -> CallContext {
        CallContext::new(
            Side::Client,
            path,
            options.metadata.clone(),
            options.deadline(),
            CancelSignal::never(),
        )
    }

    /// One request, one response.
    pub async fn unary(
        &self,
        path: &str,
        request: &DynamicMessage,
        options: CallOptions,
    ) -> Result<Response, Status> {
        let method = self.method(path, CallPattern::Unary)?;
        let payload = self.codec.encode(request, method.input())?;
        let mut ctx = self.context(path, &options);
        let (reply_tx, mut reply_rx) = oneshot::channel();

        let status = run_chain(
            &self.interceptors,
            &mut ctx,
            unary_terminal(self.connection.clone(), payload, reply_tx),
        )
        .await;
        status.into_result()?;

        let (payload, headers) = reply_rx.try_recv().map_err(|_| {
            Status::internal("interceptor completed the call without a response")
        })?;
        Ok(Response {
            message: self.codec.decode(&payload, method.output())?,
            headers,
            trailers: ctx.trailers().clone(),
        })
    }

    /// One request, a stream of responses read with [`Streaming::message`].
    pub async fn server_streaming(
        &self,
        path: &str,
        request: &DynamicMessage,
        options: CallOptions,
    ) -> Result<Streaming, Status> {
        let method = self.method(path, CallPattern::ServerStreaming)?;
        let payload = self.codec.encode(request, method.input())?;
        let mut call = self.start(method, &options).await?;
        if let Err(status) = send_and_close(&call.call, payload).await {
            return Err(abandon(&mut call.call, status).await.status);
        }
        Ok(call)
    }

    /// A stream of requests, one response from [`Streaming::finish`].
    pub async fn client_streaming(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<Streaming, Status> {
        let method = self.method(path, CallPattern::ClientStreaming)?;
        self.start(method, &options).await
    }

    /// Independent request and response streams.
    pub async fn bidirectional(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<Streaming, Status> {
        let method = self.method(path, CallPattern::Bidirectional)?;
        self.start(method, &options).await
    }

    /// Opens a streaming call inside the interceptor chain.
    ///
    /// The chain runs on its own task and stays suspended in the terminal
    /// until the call ends, so interceptors observe the final status.
    async fn start(
        &self,
        method: Arc<MethodDescriptor>,
        options: &CallOptions,
    ) -> Result<Streaming, Status> {
        let mut ctx = self.context(method.path(), options);
        let interceptors = self.interceptors.clone();
        let connection = self.connection.clone();
        let pattern = method.pattern();
        let (opened_tx, opened_rx) = oneshot::channel();

        let chain = tokio::spawn(async move {
            run_chain(
                &interceptors,
                &mut ctx,
                streaming_terminal(connection, pattern, opened_tx),
            )
            .await
        });

        match opened_rx.await {
            Ok(Ok(call)) => Ok(Streaming {
                call,
                codec: self.codec.clone(),
                method,
            }),
            Ok(Err(status)) => Err(status),
            // the chain returned without reaching the terminal
            Err(_) => {
                let status = chain
                    .await
                    .unwrap_or_else(|_| Status::internal("interceptor task failed"));
                Err(if status.is_ok() {
                    Status::internal("interceptor completed the call without opening it")
                } else {
                    status
                })
            }
        }
    }
}

fn unary_terminal(
    connection: Connection,
    payload: Vec<u8>,
    reply: oneshot::Sender<(Vec<u8>, Metadata)>,
) -> Terminal {
    terminal(move |ctx| {
        Box::pin(async move {
            let opened = connection
                .open(
                    ctx.method().to_owned(),
                    CallPattern::Unary,
                    ctx.metadata().clone(),
                    ctx.deadline(),
                )
                .await;
            let mut call = match opened {
                Ok((call, _completion)) => call,
                Err(status) => return status,
            };
            ctx.set_cancel_signal(call.info().cancel_signal().clone());

            if let Err(status) = send_and_close(&call, payload).await {
                let Completion { status, trailers } = abandon(&mut call, status).await;
                *ctx.trailers_mut() = trailers;
                return status;
            }
            let message = call.message().await;
            let Completion { status, trailers } = call.completion().await;
            *ctx.trailers_mut() = trailers;
            if !status.is_ok() {
                return status;
            }
            match message {
                Ok(Some(payload)) => {
                    let headers = call.headers().await.cloned().unwrap_or_default();
                    let _ = reply.send((payload, headers));
                    Status::ok()
                }
                Ok(None) => Status::failed_precondition("unary call finished without a response"),
                Err(status) => status,
            }
        })
    })
}

fn streaming_terminal(
    connection: Connection,
    pattern: CallPattern,
    opened: oneshot::Sender<Result<CallHandle, Status>>,
) -> Terminal {
    terminal(move |ctx| {
        Box::pin(async move {
            let result = connection
                .open(
                    ctx.method().to_owned(),
                    pattern,
                    ctx.metadata().clone(),
                    ctx.deadline(),
                )
                .await;
            let (call, completion) = match result {
                Ok(opened_call) => opened_call,
                Err(status) => {
                    let _ = opened.send(Err(status.clone()));
                    return status;
                }
            };
            ctx.set_cancel_signal(call.info().cancel_signal().clone());
            if opened.send(Ok(call)).is_err() {
                // caller went away; dropping the handle cancelled the call
                return Status::cancelled("caller dropped the call");
            }
            let Completion { status, trailers } = completion.wait().await;
            *ctx.trailers_mut() = trailers;
            status
        })
    })
}

async fn send_and_close(call: &CallHandle, payload: Vec<u8>) -> Result<(), Status> {
    call.send(payload).await?;
    call.close_send().await
}

/// Cancels a call whose request could not go out.
///
/// A server that already ended the call keeps its own status.
async fn abandon(call: &mut CallHandle, status: Status) -> Completion {
    call.cancel(status);
    call.completion().await
}

/// An open streaming call.
///
/// Dropping it before the call ends cancels the call.
pub struct Streaming {
    call: CallHandle,
    codec: Codec,
    method: Arc<MethodDescriptor>,
}

impl Streaming {
    pub fn stream_id(&self) -> u32 {
        self.call.stream_id()
    }

    /// Sends one request, waiting while the server's window is full.
    pub async fn send(&self, message: &DynamicMessage) -> Result<(), Status> {
        let bytes = self.codec.encode(message, self.method.input())?;
        self.call.send(bytes).await
    }

    /// Half-closes the request stream.
    pub async fn close_send(&self) -> Result<(), Status> {
        self.call.close_send().await
    }

    /// Next response, `None` once the server finished with OK.
    ///
    /// A response that does not decode cancels the call with the decode error.
    pub async fn message(&mut self) -> Result<Option<DynamicMessage>, Status> {
        let Some(bytes) = self.call.message().await? else {
            return Ok(None);
        };
        match self.codec.decode(&bytes, self.method.output()) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                let status = Status::from(err);
                self.call.cancel(status.clone());
                Err(status)
            }
        }
    }

    /// Server's header metadata.
    pub async fn headers(&mut self) -> Result<&Metadata, Status> {
        self.call.headers().await
    }

    /// Half-closes and waits for the single response of a
    /// client-streaming call.
    pub async fn finish(mut self) -> Result<Response, Status> {
        self.call.close_send().await?;
        let message = self.message().await?;
        let Completion { status, trailers } = self.call.completion().await;
        status.into_result()?;
        let message = message.ok_or_else(|| {
            Status::failed_precondition(format!(
                "{} call finished without a response",
                self.method.pattern()
            ))
        })?;
        let headers = self.call.headers().await.cloned().unwrap_or_default();
        Ok(Response {
            message,
            headers,
            trailers,
        })
    }

    /// Waits for the final status, discarding unread responses.
    pub async fn completion(&mut self) -> Completion {
        self.call.completion().await
    }

    /// Cancels the call and tells the server.
    pub fn cancel(&self) {
        self.call.cancel(Status::cancelled("cancelled by caller"));
    }

    /// Final status, once the call has ended.
    pub fn status(&self) -> Option<&Status> {
        self.call.status()
    }

    /// Trailers, once the call has ended.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.call.trailers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexrpc_core::{Code, FieldType, MessageDescriptor};

    fn registry() -> Arc<DescriptorRegistry> {
        let text = MessageDescriptor::builder("t.Text")
            .field(1, "text", FieldType::String)
            .build()
            .unwrap();
        Arc::new(
            DescriptorRegistry::builder()
                .message(text)
                .method("t.S", "One", "t.Text", "t.Text", CallPattern::Unary)
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn options_pick_the_earliest_deadline() {
        let absolute = Instant::now() + Duration::from_secs(10);
        let options = CallOptions::new()
            .with_deadline(absolute)
            .with_timeout(Duration::from_secs(1));
        assert_eq!(options.deadline(), Some(Instant::now() + Duration::from_secs(1)));

        let options = CallOptions::new().with_deadline(absolute);
        assert_eq!(options.deadline(), Some(absolute));
        assert_eq!(CallOptions::new().deadline(), None);
    }

    #[test]
    fn options_carry_metadata() {
        let mut options = CallOptions::new();
        options.metadata_mut().append("x-trace", "abc").unwrap();
        assert_eq!(options.metadata.get_text("x-trace"), Some("abc"));
    }

    #[tokio::test]
    async fn rejects_unknown_and_mismatched_methods() {
        let (io, _peer) = tokio::io::duplex(1024);
        let client = Client::new(
            Connection::client(io, ConnectionConfig::default()),
            registry(),
        );

        let err = client
            .client_streaming("/t.S/Missing", CallOptions::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = client
            .bidirectional("/t.S/One", CallOptions::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "/t.S/One is unary, not bidirectional");
    }
}
