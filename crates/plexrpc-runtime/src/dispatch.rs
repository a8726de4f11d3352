//! Server-side routing and call dispatch.
//!
//! A [`Router`] maps method paths to handlers. Handlers are checked
//! against the descriptor registry when they are registered, so a router
//! that builds can only serve methods the registry knows with the pattern
//! the registry declares.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use plexrpc_core::{CallPattern, Code, DescriptorRegistry, Metadata, MethodDescriptor, Status};
use plexrpc_protocol::{Codec, DynamicMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, debug_span, error, warn};

use crate::call::Side;
use crate::config::ConnectionConfig;
use crate::connection::{Acceptor, CallHandle, CallReceiver, CallSender, Connection};
use crate::deadline::CancelSignal;
use crate::error::{RuntimeError, RuntimeResult};
use crate::interceptor::{CallContext, Interceptor, Terminal, run_chain, terminal};

/// What a handler knows about the call it serves.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: String,
    metadata: Metadata,
    deadline: Option<Instant>,
    cancel: CancelSignal,
}

impl RequestContext {
    fn from_call(ctx: &CallContext) -> Self {
        Self {
            method: ctx.method().to_owned(),
            metadata: ctx.metadata().clone(),
            deadline: ctx.deadline(),
            cancel: ctx.cancel_signal().clone(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the caller cancels or the deadline passes.
    pub async fn cancelled(&self) -> Status {
        self.cancel.cancelled().await
    }
}

/// A single request message.
#[derive(Debug)]
pub struct Request {
    message: DynamicMessage,
    context: RequestContext,
}

impl Request {
    pub fn message(&self) -> &DynamicMessage {
        &self.message
    }

    pub fn into_message(self) -> DynamicMessage {
        self.message
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

/// Incoming request messages of a client-streaming or bidirectional call.
pub struct RequestStream {
    receiver: CallReceiver,
    sender: CallSender,
    codec: Codec,
    method: Arc<MethodDescriptor>,
    context: RequestContext,
}

impl RequestStream {
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Next request, or `None` once the client half-closed.
    ///
    /// A request that does not decode cancels the call with the decode error.
    pub async fn message(&mut self) -> Result<Option<DynamicMessage>, Status> {
        let Some(bytes) = self.receiver.message().await? else {
            return Ok(None);
        };
        match self.codec.decode(&bytes, self.method.input()) {
            Ok(message) => Ok(Some(message)),
            Err(err) => {
                let status = Status::from(err);
                self.sender.cancel(status.clone());
                Err(status)
            }
        }
    }

    async fn single(&mut self) -> Result<DynamicMessage, Status> {
        self.message().await?.ok_or_else(|| {
            Status::failed_precondition(format!(
                "{} call closed without its request",
                self.method.pattern()
            ))
        })
    }
}

/// Outgoing responses of a call.
pub struct ResponseSink {
    sender: CallSender,
    codec: Codec,
    method: Arc<MethodDescriptor>,
}

impl ResponseSink {
    /// Sends response header metadata. Must come before the first message.
    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.sender.send_header(metadata).await
    }

    /// Sends one response, waiting while the client's window is full.
    pub async fn send(&self, message: &DynamicMessage) -> Result<(), Status> {
        let bytes = self.codec.encode(message, self.method.output())?;
        self.sender.send(bytes).await
    }
}

type UnaryFn = dyn Fn(Request) -> BoxFuture<'static, Result<DynamicMessage, Status>> + Send + Sync;
type ServerStreamingFn =
    dyn Fn(Request, ResponseSink) -> BoxFuture<'static, Result<(), Status>> + Send + Sync;
type ClientStreamingFn =
    dyn Fn(RequestStream) -> BoxFuture<'static, Result<DynamicMessage, Status>> + Send + Sync;
type BidirectionalFn =
    dyn Fn(RequestStream, ResponseSink) -> BoxFuture<'static, Result<(), Status>> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Unary(Arc<UnaryFn>),
    ServerStreaming(Arc<ServerStreamingFn>),
    ClientStreaming(Arc<ClientStreamingFn>),
    Bidirectional(Arc<BidirectionalFn>),
}

impl Handler {
    fn pattern(&self) -> CallPattern {
        match self {
            Self::Unary(_) => CallPattern::Unary,
            Self::ServerStreaming(_) => CallPattern::ServerStreaming,
            Self::ClientStreaming(_) => CallPattern::ClientStreaming,
            Self::Bidirectional(_) => CallPattern::Bidirectional,
        }
    }

    async fn call(self, mut requests: RequestStream, sink: ResponseSink) -> Result<(), Status> {
        match self {
            Self::Unary(handler) => {
                let message = requests.single().await?;
                let context = requests.context.clone();
                let reply = handler(Request { message, context }).await?;
                sink.send(&reply).await
            }
            Self::ServerStreaming(handler) => {
                let message = requests.single().await?;
                let context = requests.context.clone();
                handler(Request { message, context }, sink).await
            }
            Self::ClientStreaming(handler) => {
                let reply = handler(requests).await?;
                sink.send(&reply).await
            }
            Self::Bidirectional(handler) => handler(requests, sink).await,
        }
    }
}

struct Route {
    method: Arc<MethodDescriptor>,
    handler: Handler,
}

/// Method table and server interceptors.
pub struct Router {
    codec: Codec,
    routes: HashMap<String, Route>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Router {
    pub fn builder(registry: Arc<DescriptorRegistry>) -> RouterBuilder {
        RouterBuilder {
            registry,
            routes: HashMap::new(),
            interceptors: Vec::new(),
            error: None,
        }
    }

    /// Registered method paths, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    fn patterns(&self) -> HashMap<String, CallPattern> {
        self.routes
            .iter()
            .map(|(path, route)| (path.clone(), route.handler.pattern()))
            .collect()
    }

    /// Runs one incoming call to completion.
    async fn dispatch(self: Arc<Self>, call: CallHandle, grace: Duration) {
        let (info, sender, receiver) = call.into_split();
        let span = debug_span!("call", stream_id = info.stream_id(), method = %info.path());

        async move {
            let Some(route) = self.routes.get(info.path()) else {
                let status = Status::unimplemented(format!("unknown method {}", info.path()));
                let _ = sender.finish(status, Metadata::new()).await;
                return;
            };
            let cancel = info.cancel_signal().clone();
            let mut ctx = CallContext::new(
                Side::Server,
                info.path(),
                info.metadata().clone(),
                info.deadline(),
                cancel.clone(),
            );
            let requests = RequestStream {
                receiver,
                sender: sender.clone(),
                codec: self.codec.clone(),
                method: route.method.clone(),
                // replaced once interceptors have run
                context: RequestContext::from_call(&ctx),
            };
            let sink = ResponseSink {
                sender: sender.clone(),
                codec: self.codec.clone(),
                method: route.method.clone(),
            };
            let handler = route.handler.clone();

            let outcome = tokio::select! {
                status = run_chain(
                    &self.interceptors,
                    &mut ctx,
                    handler_terminal(handler, requests, sink),
                ) => Some(status),
                () = grace_expired(&cancel, grace) => None,
            };

            match outcome {
                Some(status) => finish(&sender, status, ctx.trailers().clone()).await,
                None => warn!(?grace, "handler outlived its cancellation grace period; dropped"),
            }
        }
        .instrument(span)
        .await;
    }
}

fn handler_terminal(handler: Handler, mut requests: RequestStream, sink: ResponseSink) -> Terminal {
    terminal(move |ctx| {
        requests.context = RequestContext::from_call(ctx);
        Box::pin(async move {
            match AssertUnwindSafe(handler.call(requests, sink))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => Status::ok(),
                Ok(Err(status)) => status,
                Err(_) => {
                    error!("handler panicked");
                    Status::internal("handler panicked")
                }
            }
        })
    })
}

async fn grace_expired(cancel: &CancelSignal, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

async fn finish(sender: &CallSender, status: Status, trailers: Metadata) {
    let Err(err) = sender.finish(status, trailers).await else {
        return;
    };
    if err.code() == Code::StreamAlreadyClosed || err.code().is_unavailable() {
        // cancelled or disconnected meanwhile
        debug!(code = %err.code(), "call ended before its status was sent");
        return;
    }
    // e.g. OK from a unary handler that never produced its response
    warn!(code = %err.code(), message = err.message(), "handler result rejected");
    let _ = sender.finish(err, Metadata::new()).await;
}

/// Builds a [`Router`]. Registration errors surface from [`RouterBuilder::build`].
pub struct RouterBuilder {
    registry: Arc<DescriptorRegistry>,
    routes: HashMap<String, Route>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    error: Option<RuntimeError>,
}

impl RouterBuilder {
    fn route(mut self, path: &str, handler: Handler) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(method) = self.registry.method(path) else {
            self.error = Some(RuntimeError::registration(path, "no such method in the registry"));
            return self;
        };
        if method.pattern() != handler.pattern() {
            self.error = Some(RuntimeError::registration(
                path,
                format!(
                    "method is {}, handler is {}",
                    method.pattern(),
                    handler.pattern()
                ),
            ));
            return self;
        }
        if self.routes.contains_key(path) {
            self.error = Some(RuntimeError::registration(path, "handler already registered"));
            return self;
        }
        self.routes.insert(
            path.to_owned(),
            Route {
                method: method.clone(),
                handler,
            },
        );
        self
    }

    #[must_use]
    pub fn unary<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynamicMessage, Status>> + Send + 'static,
    {
        self.route(
            path,
            Handler::Unary(Arc::new(move |request: Request| handler(request).boxed())),
        )
    }

    #[must_use]
    pub fn server_streaming<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(Request, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.route(
            path,
            Handler::ServerStreaming(Arc::new(move |request: Request, sink: ResponseSink| {
                handler(request, sink).boxed()
            })),
        )
    }

    #[must_use]
    pub fn client_streaming<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(RequestStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynamicMessage, Status>> + Send + 'static,
    {
        self.route(
            path,
            Handler::ClientStreaming(Arc::new(move |requests: RequestStream| {
                handler(requests).boxed()
            })),
        )
    }

    #[must_use]
    pub fn bidirectional<F, Fut>(self, path: &str, handler: F) -> Self
    where
        F: Fn(RequestStream, ResponseSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.route(
            path,
            Handler::Bidirectional(Arc::new(move |requests: RequestStream, sink: ResponseSink| {
                handler(requests, sink).boxed()
            })),
        )
    }

    /// Adds a server interceptor. The first one added is the outermost.
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> RuntimeResult<Router> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(Router {
            codec: Codec::new(self.registry),
            routes: self.routes,
            interceptors: self.interceptors,
        })
    }
}

/// Serves a [`Router`] on connections.
#[derive(Clone)]
pub struct Server {
    router: Arc<Router>,
    methods: Arc<HashMap<String, CallPattern>>,
    config: ConnectionConfig,
}

impl Server {
    pub fn new(router: Router, config: ConnectionConfig) -> RuntimeResult<Self> {
        config.validate()?;
        Ok(Self {
            methods: Arc::new(router.patterns()),
            router: Arc::new(router),
            config,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Serves one connection until the peer goes away.
    pub async fn serve_connection<IO>(&self, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.serve_connection_until(io, std::future::pending()).await;
    }

    /// Serves one connection until the peer goes away or `shutdown`
    /// resolves, which sends GOAWAY.
    ///
    /// Returns once every dispatched handler has finished or been dropped.
    pub async fn serve_connection_until<IO, F>(&self, io: IO, shutdown: F)
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
        F: Future<Output = ()>,
    {
        let (calls_tx, mut calls) = mpsc::channel(self.config.incoming_backlog);
        let acceptor = Acceptor::new(self.methods.clone(), calls_tx);
        let connection = Connection::spawn(io, Side::Server, self.config.clone(), Some(acceptor));
        tokio::pin!(shutdown);
        let mut closing = false;
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                call = calls.recv() => match call {
                    Some(call) => {
                        handlers.spawn(self.router.clone().dispatch(call, self.config.cancel_grace));
                    }
                    None => break,
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                () = &mut shutdown, if !closing => {
                    closing = true;
                    connection.close();
                }
            }
        }
        connection.closed().await;
        // cancelled handlers get at most cancel_grace before dispatch drops them
        while handlers.join_next().await.is_some() {}
        debug!("connection served");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexrpc_core::{FieldType, MessageDescriptor};

    fn registry() -> Arc<DescriptorRegistry> {
        let text = MessageDescriptor::builder("t.Text")
            .field(1, "text", FieldType::String)
            .build()
            .unwrap();
        Arc::new(
            DescriptorRegistry::builder()
                .message(text)
                .method("t.S", "One", "t.Text", "t.Text", CallPattern::Unary)
                .method("t.S", "Many", "t.Text", "t.Text", CallPattern::ServerStreaming)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn registers_matching_handlers() {
        let router = Router::builder(registry())
            .unary("/t.S/One", |request| async move { Ok(request.into_message()) })
            .server_streaming("/t.S/Many", |_request, _sink| async move { Ok(()) })
            .build()
            .unwrap();
        assert_eq!(router.methods(), ["/t.S/Many", "/t.S/One"]);
        assert_eq!(router.patterns()["/t.S/Many"], CallPattern::ServerStreaming);
    }

    #[test]
    fn rejects_unknown_paths() {
        let err = Router::builder(registry())
            .unary("/t.S/Missing", |request| async move { Ok(request.into_message()) })
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Cannot register /t.S/Missing: no such method in the registry"
        );
    }

    #[test]
    fn rejects_pattern_mismatch() {
        let err = Router::builder(registry())
            .unary("/t.S/Many", |request| async move { Ok(request.into_message()) })
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Cannot register /t.S/Many: method is server-streaming, handler is unary"
        );
    }

    #[test]
    fn rejects_duplicate_registration() {
        let result = Router::builder(registry())
            .unary("/t.S/One", |request| async move { Ok(request.into_message()) })
            .unary("/t.S/One", |request| async move { Ok(request.into_message()) })
            .build();
        assert!(matches!(result, Err(RuntimeError::Registration { .. })));
    }

    #[test]
    fn server_rejects_invalid_config() {
        let router = Router::builder(registry()).build().unwrap();
        let config = ConnectionConfig::default().with_initial_window(0);
        assert!(matches!(
            Server::new(router, config),
            Err(RuntimeError::Config { .. })
        ));
    }
}
