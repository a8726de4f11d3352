//! Connection multiplexer.
//!
//! One connection runs three tasks:
//!
//! - the reader decodes frames from the transport and queues them,
//! - the writer drains encoded frames onto the transport in order,
//! - the coordinator owns every call: its state machine, flow-control
//!   windows, parked sends and deadline timer.
//!
//! Applications talk to the coordinator through [`CallHandle`]s, which
//! send commands and receive per-call events. The coordinator never
//! awaits the transport, so a slow peer only stalls the writer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use plexrpc_core::{CallPattern, Metadata, Status};
use plexrpc_protocol::{
    Frame, FrameKind, FrameReader, FrameWriter, HeaderBlock, MAX_STREAM_ID, ProtocolError,
    TrailerBlock, decode_credit, decode_status, encode_credit, encode_status, frame_len,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::call::{CallState, Side};
use crate::config::ConnectionConfig;
use crate::deadline::{CancelSignal, CancelSource, DeadlineTimer, deadline_after, remaining};
use crate::flow::{RecvWindow, SendWindow};

/// Frames buffered between the reader and the coordinator.
const INBOUND_QUEUE: usize = 64;

/// How often retired stream ids are forgotten.
const PRUNE_INTERVAL: Duration = Duration::from_millis(500);

fn connection_gone() -> Status {
    Status::connection_closed("connection closed")
}

/// Final outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    pub trailers: Metadata,
}

impl Completion {
    pub fn new(status: Status, trailers: Metadata) -> Self {
        Self { status, trailers }
    }

    pub fn failed(status: Status) -> Self {
        Self::new(status, Metadata::new())
    }
}

/// Resolves once the call has ended, however it ended.
#[derive(Debug)]
pub struct CallCompletion {
    rx: oneshot::Receiver<Completion>,
}

impl CallCompletion {
    pub async fn wait(self) -> Completion {
        self.rx
            .await
            .unwrap_or_else(|_| Completion::failed(connection_gone()))
    }
}

/// What one end knows about a call when it starts.
#[derive(Debug, Clone)]
pub struct CallInfo {
    stream_id: u32,
    side: Side,
    path: String,
    metadata: Metadata,
    deadline: Option<Instant>,
    cancel: CancelSignal,
}

impl CallInfo {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request metadata: sent by a client, received by a server.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }
}

pub(crate) enum Command {
    Open {
        path: String,
        pattern: CallPattern,
        metadata: Metadata,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<(CallHandle, CallCompletion), Status>>,
    },
    SendHeader {
        stream_id: u32,
        metadata: Metadata,
        done: oneshot::Sender<Result<(), Status>>,
    },
    SendMessage {
        stream_id: u32,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), Status>>,
    },
    CloseSend {
        stream_id: u32,
        done: oneshot::Sender<Result<(), Status>>,
    },
    Finish {
        stream_id: u32,
        completion: Completion,
        done: oneshot::Sender<Result<(), Status>>,
    },
    Consumed {
        stream_id: u32,
        cost: u32,
    },
    Cancel {
        stream_id: u32,
        status: Status,
    },
    DeadlineExpired {
        stream_id: u32,
    },
    Close {
        status: Status,
    },
}

#[derive(Debug)]
pub(crate) enum CallEvent {
    Header(Metadata),
    Message { payload: Vec<u8>, cost: u32 },
    HalfClosed,
    Finished(Completion),
}

/// Hands peer-initiated calls to a dispatcher.
#[derive(Clone)]
pub(crate) struct Acceptor {
    methods: Arc<HashMap<String, CallPattern>>,
    calls: mpsc::Sender<CallHandle>,
}

impl Acceptor {
    pub(crate) fn new(
        methods: Arc<HashMap<String, CallPattern>>,
        calls: mpsc::Sender<CallHandle>,
    ) -> Self {
        Self { methods, calls }
    }
}

/// A multiplexed connection. Clones share the same transport.
///
/// The connection stays up while any clone or call handle is alive, or
/// until [`Connection::close`], a transport failure or a protocol violation.
#[derive(Clone)]
pub struct Connection {
    side: Side,
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Starts the client end of a connection over `io`.
    pub fn client<IO>(io: IO, config: ConnectionConfig) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(io, Side::Client, config, None)
    }

    pub(crate) fn spawn<IO>(
        io: IO,
        side: Side,
        config: ConnectionConfig,
        acceptor: Option<Acceptor>,
    ) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_from(io, side, config, acceptor, side.first_stream_id())
    }

    /// Like [`Connection::spawn`], allocating local stream ids from `first_id`.
    pub(crate) fn spawn_from<IO>(
        io: IO,
        side: Side,
        config: ConnectionConfig,
        acceptor: Option<Acceptor>,
        first_id: u32,
    ) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let span = info_span!("connection", side = %side);
        let reader_task = tokio::spawn(
            read_loop(FrameReader::new(reader), inbound_tx.clone()).instrument(span.clone()),
        );
        tokio::spawn(
            write_loop(FrameWriter::new(writer), outbound_rx, inbound_tx).instrument(span.clone()),
        );

        let coordinator = Coordinator {
            side,
            commands: commands_tx.downgrade(),
            outbound: outbound_tx,
            acceptor,
            streams: HashMap::new(),
            retired: HashMap::new(),
            next_local_id: u64::from(first_id),
            last_peer_id: 0,
            config,
        };
        tokio::spawn(
            coordinator
                .run(commands_rx, inbound_rx, reader_task, closed_tx)
                .instrument(span),
        );

        Self {
            side,
            commands: commands_tx,
            closed: closed_rx,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Starts a call. The HEADER frame is queued before this returns.
    pub async fn open(
        &self,
        path: impl Into<String>,
        pattern: CallPattern,
        metadata: Metadata,
        deadline: Option<Instant>,
    ) -> Result<(CallHandle, CallCompletion), Status> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Open {
                path: path.into(),
                pattern,
                metadata,
                deadline,
                reply,
            })
            .map_err(|_| connection_gone())?;
        rx.await.map_err(|_| connection_gone())?
    }

    /// Sends GOAWAY and cancels every open call.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close {
            status: Status::connection_closed("connection closed"),
        });
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Waits until the coordinator has shut down.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Sends a cancel when the last half of an unfinished call handle drops.
struct CancelOnDrop {
    stream_id: u32,
    commands: mpsc::UnboundedSender<Command>,
    finished: AtomicBool,
}

impl CancelOnDrop {
    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            let _ = self.commands.send(Command::Cancel {
                stream_id: self.stream_id,
                status: Status::cancelled("call handle dropped"),
            });
        }
    }
}

/// Raw, payload-level handle on one call.
///
/// Typed client and server APIs wrap this. It can be split so one task
/// reads while another writes.
pub struct CallHandle {
    info: CallInfo,
    sender: CallSender,
    receiver: CallReceiver,
}

impl CallHandle {
    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn stream_id(&self) -> u32 {
        self.info.stream_id
    }

    pub fn into_split(self) -> (CallInfo, CallSender, CallReceiver) {
        (self.info, self.sender, self.receiver)
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.sender.send_header(metadata).await
    }

    pub async fn send(&self, payload: Vec<u8>) -> Result<(), Status> {
        self.sender.send(payload).await
    }

    pub async fn close_send(&self) -> Result<(), Status> {
        self.sender.close_send().await
    }

    pub async fn finish(&self, status: Status, trailers: Metadata) -> Result<(), Status> {
        self.sender.finish(status, trailers).await
    }

    pub fn cancel(&self, status: Status) {
        self.sender.cancel(status);
    }

    pub async fn message(&mut self) -> Result<Option<Vec<u8>>, Status> {
        self.receiver.message().await
    }

    pub async fn headers(&mut self) -> Result<&Metadata, Status> {
        self.receiver.headers().await
    }

    pub async fn completion(&mut self) -> Completion {
        self.receiver.completion().await
    }

    pub fn status(&self) -> Option<&Status> {
        self.receiver.status()
    }

    pub fn trailers(&self) -> Option<&Metadata> {
        self.receiver.trailers()
    }
}

/// Outbound half of a call.
#[derive(Clone)]
pub struct CallSender {
    stream_id: u32,
    commands: mpsc::UnboundedSender<Command>,
    guard: Arc<CancelOnDrop>,
}

impl CallSender {
    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), Status>>) -> Command,
    ) -> Result<(), Status> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(command(done))
            .map_err(|_| connection_gone())?;
        rx.await.unwrap_or_else(|_| Err(connection_gone()))
    }

    /// Sends the response header (server side).
    ///
    /// Optional: the first message or the final status sends an empty one.
    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        let stream_id = self.stream_id;
        self.request(|done| Command::SendHeader {
            stream_id,
            metadata,
            done,
        })
        .await
    }

    /// Sends one message, waiting while the peer's window is full.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), Status> {
        let stream_id = self.stream_id;
        self.request(|done| Command::SendMessage {
            stream_id,
            payload,
            done,
        })
        .await
    }

    /// Half-closes the client's direction.
    pub async fn close_send(&self) -> Result<(), Status> {
        let stream_id = self.stream_id;
        self.request(|done| Command::CloseSend { stream_id, done })
            .await
    }

    /// Ends the call with a final status and trailers (server side).
    pub async fn finish(&self, status: Status, trailers: Metadata) -> Result<(), Status> {
        let stream_id = self.stream_id;
        let completion = Completion::new(status, trailers);
        self.request(|done| Command::Finish {
            stream_id,
            completion,
            done,
        })
        .await?;
        self.guard.mark_finished();
        Ok(())
    }

    /// Cancels the call locally and tells the peer.
    pub fn cancel(&self, status: Status) {
        self.guard.mark_finished();
        let _ = self.commands.send(Command::Cancel {
            stream_id: self.stream_id,
            status,
        });
    }
}

/// Inbound half of a call.
pub struct CallReceiver {
    stream_id: u32,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    guard: Arc<CancelOnDrop>,
    headers: Option<Metadata>,
    buffered: VecDeque<(Vec<u8>, u32)>,
    half_closed: bool,
    completion: Option<Completion>,
}

impl CallReceiver {
    /// Next event, or `None` once the call has ended.
    async fn next_event(&mut self) -> Option<CallEvent> {
        if self.completion.is_some() {
            return None;
        }
        match self.events.recv().await {
            Some(CallEvent::Finished(completion)) => {
                self.guard.mark_finished();
                self.completion = Some(completion);
                None
            }
            Some(event) => Some(event),
            None => {
                self.completion = Some(Completion::failed(connection_gone()));
                None
            }
        }
    }

    fn deliver(&mut self, payload: Vec<u8>, cost: u32) -> Vec<u8> {
        let _ = self.commands.send(Command::Consumed {
            stream_id: self.stream_id,
            cost,
        });
        payload
    }

    /// Next message.
    ///
    /// `Ok(None)` once the peer closed its direction or finished with OK.
    /// An error status once the call failed or was cancelled.
    pub async fn message(&mut self) -> Result<Option<Vec<u8>>, Status> {
        if let Some((payload, cost)) = self.buffered.pop_front() {
            return Ok(Some(self.deliver(payload, cost)));
        }
        loop {
            if self.half_closed {
                return Ok(None);
            }
            match self.next_event().await {
                Some(CallEvent::Header(metadata)) => self.headers = Some(metadata),
                Some(CallEvent::Message { payload, cost }) => {
                    return Ok(Some(self.deliver(payload, cost)));
                }
                Some(CallEvent::HalfClosed) => self.half_closed = true,
                Some(CallEvent::Finished(_)) | None => {
                    return match &self.completion {
                        Some(done) if !done.status.is_ok() => Err(done.status.clone()),
                        _ => Ok(None),
                    };
                }
            }
        }
    }

    /// Peer's header metadata, waiting for it if needed.
    ///
    /// A call that fails before any header returns its status.
    pub async fn headers(&mut self) -> Result<&Metadata, Status> {
        while self.headers.is_none() {
            match self.next_event().await {
                Some(CallEvent::Header(metadata)) => self.headers = Some(metadata),
                Some(CallEvent::Message { payload, cost }) => self.buffered.push_back((payload, cost)),
                Some(CallEvent::HalfClosed) => self.half_closed = true,
                Some(CallEvent::Finished(_)) | None => match &self.completion {
                    Some(done) if !done.status.is_ok() => return Err(done.status.clone()),
                    _ => break,
                },
            }
        }
        Ok(self.headers.get_or_insert_with(Metadata::new))
    }

    /// Waits for the final status, consuming any unread messages.
    pub async fn completion(&mut self) -> Completion {
        while let Some((payload, cost)) = self.buffered.pop_front() {
            self.deliver(payload, cost);
        }
        loop {
            match self.next_event().await {
                Some(CallEvent::Header(metadata)) => self.headers = Some(metadata),
                Some(CallEvent::Message { payload, cost }) => {
                    self.deliver(payload, cost);
                }
                Some(CallEvent::HalfClosed) => self.half_closed = true,
                Some(CallEvent::Finished(_)) | None => break,
            }
        }
        self.completion
            .clone()
            .unwrap_or_else(|| Completion::failed(connection_gone()))
    }

    /// Final status, once the call has ended.
    pub fn status(&self) -> Option<&Status> {
        self.completion.as_ref().map(|done| &done.status)
    }

    /// Trailers, once the call has ended.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.completion.as_ref().map(|done| &done.trailers)
    }
}

enum Inbound {
    Frame(Frame),
    Closed,
    Failed(ProtocolError),
}

/// Why the coordinator stopped.
enum Shutdown {
    /// This end closes; the peer is told with GOAWAY.
    Local(Status),
    /// The peer closed or the transport failed.
    Peer(Status),
}

enum Outgoing {
    Message {
        bytes: Vec<u8>,
        cost: u32,
        done: oneshot::Sender<Result<(), Status>>,
    },
    Control(Vec<u8>),
}

struct Stream {
    state: CallState,
    events: mpsc::UnboundedSender<CallEvent>,
    cancel: CancelSource,
    completion: oneshot::Sender<Completion>,
    outcome: Option<Completion>,
    send_window: SendWindow,
    recv_window: RecvWindow,
    pending: VecDeque<Outgoing>,
    undelivered: usize,
    _timer: Option<DeadlineTimer>,
}

impl Stream {
    fn end(self, completion: Completion, cancelled: bool) {
        if cancelled {
            self.cancel.cancel(completion.status.clone());
        }
        let parked = if completion.status.is_ok() {
            Status::stream_already_closed("call finished")
        } else {
            completion.status.clone()
        };
        for outgoing in self.pending {
            if let Outgoing::Message { done, .. } = outgoing {
                let _ = done.send(Err(parked.clone()));
            }
        }
        let _ = self.events.send(CallEvent::Finished(completion.clone()));
        let _ = self.completion.send(completion);
    }
}

/// A stream id that recently stopped being live.
struct Retired {
    at: Instant,
    /// The peer ended the call with its final TRAILER.
    peer_finished: bool,
}

struct Coordinator {
    side: Side,
    config: ConnectionConfig,
    commands: mpsc::WeakUnboundedSender<Command>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    acceptor: Option<Acceptor>,
    streams: HashMap<u32, Stream>,
    retired: HashMap<u32, Retired>,
    next_local_id: u64,
    last_peer_id: u32,
}

fn emit(outbound: &mpsc::UnboundedSender<Vec<u8>>, bytes: Vec<u8>) {
    // the writer only stops after a transport failure, which the reader reports
    let _ = outbound.send(bytes);
}

fn encode_frame(stream_id: u32, kind: FrameKind, payload: Vec<u8>) -> Result<Vec<u8>, Status> {
    Frame::new(stream_id, kind, payload)
        .to_bytes()
        .map_err(|e| Status::resource_exhausted(e.to_string()))
}

fn frame_cost(stream_id: u32, payload_len: usize) -> u32 {
    u32::try_from(frame_len(stream_id, payload_len)).unwrap_or(u32::MAX)
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
        reader: JoinHandle<()>,
        closed: watch::Sender<bool>,
    ) {
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                command = commands.recv() => {
                    let result = match command {
                        Some(command) => self.handle_command(command),
                        None => Err(Shutdown::Local(connection_gone())),
                    };
                    if let Err(reason) = result {
                        break reason;
                    }
                }
                next = inbound.recv() => {
                    let result = match next {
                        Some(Inbound::Frame(frame)) => self.handle_frame(frame),
                        Some(Inbound::Closed) | None => {
                            Err(Shutdown::Peer(Status::connection_closed("peer closed the connection")))
                        }
                        Some(Inbound::Failed(err)) => Err(transport_failure(err)),
                    };
                    if let Err(reason) = result {
                        break reason;
                    }
                }
                _ = prune.tick() => self.prune_retired(),
            }
        };

        self.shutdown(reason);
        reader.abort();
        let _ = closed.send(true);
    }

    fn shutdown(&mut self, reason: Shutdown) {
        let status = match reason {
            Shutdown::Local(status) => {
                if let Ok(bytes) = encode_frame(0, FrameKind::GoAway, encode_status(&status)) {
                    emit(&self.outbound, bytes);
                }
                status
            }
            Shutdown::Peer(status) => status,
        };
        if status.code().is_unavailable() {
            debug!(code = %status.code(), message = status.message(), "connection closing");
        } else {
            warn!(code = %status.code(), message = status.message(), "connection failed");
        }

        let cancelled = if status.code().is_unavailable() {
            status
        } else {
            Status::connection_closed(status.message())
        };
        for (_, mut stream) in self.streams.drain() {
            stream.state.cancel();
            stream.end(Completion::failed(cancelled.clone()), true);
        }
        self.acceptor = None;
    }

    fn handle_command(&mut self, command: Command) -> Result<(), Shutdown> {
        match command {
            Command::Open {
                path,
                pattern,
                metadata,
                deadline,
                reply,
            } => return self.open(path, pattern, metadata, deadline, reply),
            Command::SendHeader {
                stream_id,
                metadata,
                done,
            } => {
                let _ = done.send(self.send_header(stream_id, metadata));
            }
            Command::SendMessage {
                stream_id,
                payload,
                done,
            } => self.send_message(stream_id, payload, done),
            Command::CloseSend { stream_id, done } => {
                let _ = done.send(self.close_send(stream_id));
            }
            Command::Finish {
                stream_id,
                completion,
                done,
            } => {
                let _ = done.send(self.finish(stream_id, completion));
            }
            Command::Consumed { stream_id, cost } => self.consumed(stream_id, cost),
            Command::Cancel { stream_id, status } => self.cancel_stream(stream_id, status, true),
            Command::DeadlineExpired { stream_id } => {
                debug!(stream_id, "deadline expired");
                self.cancel_stream(
                    stream_id,
                    Status::deadline_exceeded("deadline exceeded"),
                    true,
                );
            }
            Command::Close { status } => return Err(Shutdown::Local(status)),
        }
        Ok(())
    }

    fn new_stream(
        &self,
        stream_id: u32,
        state: CallState,
        path: String,
        metadata: Metadata,
        deadline: Option<Instant>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> (Stream, CallHandle, CallCompletion) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel, signal) = CancelSource::new();
        let (completion_tx, completion_rx) = oneshot::channel();
        let timer = deadline.map(|at| DeadlineTimer::arm(at, stream_id, commands.clone()));
        let guard = Arc::new(CancelOnDrop {
            stream_id,
            commands: commands.clone(),
            finished: AtomicBool::new(false),
        });

        let side = state.side();
        let info = CallInfo {
            stream_id,
            side,
            path,
            metadata: metadata.clone(),
            deadline,
            cancel: signal,
        };
        let handle = CallHandle {
            info,
            sender: CallSender {
                stream_id,
                commands: commands.clone(),
                guard: guard.clone(),
            },
            receiver: CallReceiver {
                stream_id,
                commands,
                events: events_rx,
                guard,
                // a server already holds the request header
                headers: (side == Side::Server).then_some(metadata),
                buffered: VecDeque::new(),
                half_closed: false,
                completion: None,
            },
        };
        let stream = Stream {
            state,
            events: events_tx,
            cancel,
            completion: completion_tx,
            outcome: None,
            send_window: SendWindow::new(self.config.initial_window),
            recv_window: RecvWindow::new(self.config.initial_window),
            pending: VecDeque::new(),
            undelivered: 0,
            _timer: timer,
        };
        (stream, handle, CallCompletion { rx: completion_rx })
    }

    fn open(
        &mut self,
        path: String,
        pattern: CallPattern,
        metadata: Metadata,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<(CallHandle, CallCompletion), Status>>,
    ) -> Result<(), Shutdown> {
        if self.streams.len() >= self.config.max_concurrent_streams {
            let _ = reply.send(Err(Status::resource_exhausted(format!(
                "{} calls already open",
                self.streams.len()
            ))));
            return Ok(());
        }
        if self.next_local_id > u64::from(MAX_STREAM_ID) {
            let status = Status::resource_exhausted("stream ids exhausted");
            let _ = reply.send(Err(status.clone()));
            return Err(Shutdown::Local(status));
        }
        let stream_id = self.next_local_id as u32;
        let Some(commands) = self.commands.upgrade() else {
            let _ = reply.send(Err(connection_gone()));
            return Ok(());
        };

        let header = HeaderBlock::request(path.clone(), deadline.map(remaining), metadata.clone());
        let bytes = match encode_frame(stream_id, FrameKind::Header, header.encode()) {
            Ok(bytes) => bytes,
            Err(status) => {
                let _ = reply.send(Err(status));
                return Ok(());
            }
        };
        let mut state = CallState::client(pattern);
        if let Err(err) = state.send_header() {
            let _ = reply.send(Err(err.into()));
            return Ok(());
        }

        self.next_local_id += 2;
        emit(&self.outbound, bytes);
        debug!(stream_id, path = %path, %pattern, "call opened");

        let (stream, handle, completion) =
            self.new_stream(stream_id, state, path, metadata, deadline, commands);
        self.streams.insert(stream_id, stream);
        // a caller that went away drops the handle, which cancels the call
        let _ = reply.send(Ok((handle, completion)));
        Ok(())
    }

    fn live(&mut self, stream_id: u32) -> Result<&mut Stream, Status> {
        self.streams
            .get_mut(&stream_id)
            .ok_or_else(|| Status::stream_already_closed(format!("stream {stream_id} is closed")))
    }

    /// Emits the server's response header if it has not gone out yet.
    fn ensure_header(
        outbound: &mpsc::UnboundedSender<Vec<u8>>,
        stream_id: u32,
        stream: &mut Stream,
    ) -> Result<(), Status> {
        if stream.state.side() == Side::Client || stream.state.local_header_sent() {
            return Ok(());
        }
        let bytes = encode_frame(
            stream_id,
            FrameKind::Header,
            HeaderBlock::response(Metadata::new()).encode(),
        )?;
        stream.state.send_header()?;
        emit(outbound, bytes);
        Ok(())
    }

    fn send_header(&mut self, stream_id: u32, metadata: Metadata) -> Result<(), Status> {
        let side = self.side;
        let stream = self.live(stream_id)?;
        if stream.state.side() != Side::Server {
            return Err(Status::failed_precondition(format!(
                "the {side} sends its header when opening the call"
            )));
        }
        let bytes = encode_frame(
            stream_id,
            FrameKind::Header,
            HeaderBlock::response(metadata).encode(),
        )?;
        stream.state.send_header()?;
        emit(&self.outbound, bytes);
        Ok(())
    }

    fn send_message(
        &mut self,
        stream_id: u32,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), Status>>,
    ) {
        if payload.len() > self.config.max_message_size {
            let _ = done.send(Err(Status::resource_exhausted(format!(
                "message of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.config.max_message_size
            ))));
            return;
        }
        let outbound = self.outbound.clone();
        let queued = self.live(stream_id).and_then(|stream| {
            Self::ensure_header(&outbound, stream_id, stream)?;
            stream.state.send_message()?;
            Ok(stream)
        });
        let stream = match queued {
            Ok(stream) => stream,
            Err(status) => {
                let _ = done.send(Err(status));
                return;
            }
        };
        let cost = frame_cost(stream_id, payload.len());
        match encode_frame(stream_id, FrameKind::Message, payload) {
            Ok(bytes) => stream.pending.push_back(Outgoing::Message { bytes, cost, done }),
            Err(status) => {
                let _ = done.send(Err(status));
                return;
            }
        }
        self.flush(stream_id);
    }

    /// Half-closes a client call.
    ///
    /// A call the server already finished has nothing left to close, so that
    /// succeeds; the caller reads the server's status from the call.
    fn close_send(&mut self, stream_id: u32) -> Result<(), Status> {
        if self.peer_finished(stream_id) {
            trace!(stream_id, "half-close after the peer finished");
            return Ok(());
        }
        let stream = self.live(stream_id)?;
        if stream.state.side() != Side::Client {
            return Err(Status::failed_precondition(
                "a server ends the call with a status",
            ));
        }
        let bytes = encode_frame(
            stream_id,
            FrameKind::Trailer,
            TrailerBlock::half_close().encode(),
        )?;
        stream.state.close_send()?;
        stream.pending.push_back(Outgoing::Control(bytes));
        self.flush(stream_id);
        Ok(())
    }

    fn finish(&mut self, stream_id: u32, completion: Completion) -> Result<(), Status> {
        let outbound = self.outbound.clone();
        let stream = self.live(stream_id)?;
        if stream.state.side() != Side::Server {
            return Err(Status::failed_precondition(
                "a client half-closes instead of finishing",
            ));
        }
        let trailer =
            TrailerBlock::with_status(completion.status.clone(), completion.trailers.clone());
        let bytes = encode_frame(stream_id, FrameKind::Trailer, trailer.encode())?;
        Self::ensure_header(&outbound, stream_id, stream)?;
        stream.state.finish(&completion.status)?;
        debug!(stream_id, code = %completion.status.code(), "call finished");
        stream.outcome = Some(completion);
        stream.pending.push_back(Outgoing::Control(bytes));
        self.flush(stream_id);
        Ok(())
    }

    /// Writes parked frames the window allows, then retires a finished call.
    fn flush(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        loop {
            match stream.pending.front() {
                None => break,
                Some(Outgoing::Message { cost, .. })
                    if stream.send_window.consume(*cost).is_err() =>
                {
                    trace!(
                        stream_id,
                        outstanding = stream.send_window.outstanding(),
                        "send parked for credit"
                    );
                    break;
                }
                Some(_) => {}
            }
            match stream.pending.pop_front() {
                Some(Outgoing::Message { bytes, done, .. }) => {
                    emit(&self.outbound, bytes);
                    let _ = done.send(Ok(()));
                }
                Some(Outgoing::Control(bytes)) => emit(&self.outbound, bytes),
                None => break,
            }
        }
        if stream.pending.is_empty() && stream.state.is_terminal() {
            let completion = stream
                .outcome
                .clone()
                .unwrap_or_else(|| Completion::failed(Status::ok()));
            self.end_stream(stream_id, completion, false);
        }
    }

    fn end_stream(&mut self, stream_id: u32, completion: Completion, cancelled: bool) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            stream.end(completion, cancelled);
            self.retire(stream_id, false);
        }
    }

    fn retire(&mut self, stream_id: u32, peer_finished: bool) {
        let retired = Retired {
            at: Instant::now(),
            peer_finished,
        };
        self.retired.insert(stream_id, retired);
    }

    fn peer_finished(&self, stream_id: u32) -> bool {
        !self.streams.contains_key(&stream_id)
            && self
                .retired
                .get(&stream_id)
                .is_some_and(|retired| retired.peer_finished)
    }

    fn consumed(&mut self, stream_id: u32, cost: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        stream.undelivered = stream.undelivered.saturating_sub(1);
        let queue_empty = stream.undelivered == 0;
        if let Some(increment) = stream.recv_window.consume(cost, queue_empty)
            && !stream.state.is_terminal()
        {
            trace!(stream_id, increment, "returning credit");
            if let Ok(bytes) = encode_frame(stream_id, FrameKind::Credit, encode_credit(increment)) {
                emit(&self.outbound, bytes);
            }
        }
    }

    /// Ends a call with an error. `notify_peer` sends CANCEL.
    ///
    /// A call that already finished locally but still has frames parked for
    /// credit keeps its own outcome; only the parked frames are dropped.
    fn cancel_stream(&mut self, stream_id: u32, status: Status, notify_peer: bool) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let (completion, cancelled) = if stream.state.cancel() {
            debug!(stream_id, code = %status.code(), message = status.message(), "call cancelled");
            (Completion::failed(status.clone()), true)
        } else if !stream.pending.is_empty() {
            debug!(stream_id, code = %status.code(), "parked frames of a finished call dropped");
            let outcome = stream
                .outcome
                .clone()
                .unwrap_or_else(|| Completion::failed(Status::ok()));
            (outcome, false)
        } else {
            return;
        };
        if notify_peer
            && let Ok(bytes) = encode_frame(stream_id, FrameKind::Cancel, encode_status(&status))
        {
            emit(&self.outbound, bytes);
        }
        self.end_stream(stream_id, completion, cancelled);
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Shutdown> {
        let stream_id = frame.stream_id;
        trace!(stream_id, kind = %frame.kind, len = frame.payload.len(), "frame received");

        if stream_id == 0 || frame.kind == FrameKind::GoAway {
            return match frame.kind {
                FrameKind::GoAway if stream_id == 0 => {
                    let status = decode_status(&frame.payload)
                        .unwrap_or_else(|_| Status::connection_closed("peer went away"));
                    debug!(code = %status.code(), "peer sent GOAWAY");
                    Err(Shutdown::Peer(if status.code().is_unavailable() {
                        status
                    } else {
                        Status::connection_closed(status.message())
                    }))
                }
                kind => Err(Shutdown::Local(Status::wire_format(format!(
                    "{kind} frame on stream {stream_id}"
                )))),
            };
        }

        if self.streams.contains_key(&stream_id) {
            self.live_frame(frame);
            return Ok(());
        }
        if frame.kind == FrameKind::Header
            && !self.side.owns(stream_id)
            && stream_id > self.last_peer_id
        {
            self.accept(frame);
            return Ok(());
        }
        self.stale_frame(frame)
    }

    /// A frame for a stream that is not live.
    fn stale_frame(&mut self, frame: Frame) -> Result<(), Shutdown> {
        let stream_id = frame.stream_id;
        let ours = self.side.owns(stream_id);
        let opened = if ours {
            u64::from(stream_id) < self.next_local_id
        } else {
            stream_id <= self.last_peer_id
        };
        if !opened {
            return Err(Shutdown::Local(Status::wire_format(format!(
                "{} frame for stream {stream_id}, which was never opened",
                frame.kind
            ))));
        }
        if frame.kind == FrameKind::Header && !ours {
            return Err(Shutdown::Local(Status::wire_format(format!(
                "stream id {stream_id} reused (last was {})",
                self.last_peer_id
            ))));
        }

        let recent = self
            .retired
            .get(&stream_id)
            .is_some_and(|retired| retired.at.elapsed() < self.config.rearm_window);
        match frame.kind {
            FrameKind::Trailer if recent => {
                trace!(stream_id, "duplicate trailer ignored");
            }
            // both may cross our own close
            FrameKind::Cancel | FrameKind::Credit => {}
            kind => {
                debug!(stream_id, %kind, "frame for a closed stream");
                let status = Status::stream_already_closed(format!("stream {stream_id} is closed"));
                if let Ok(bytes) = encode_frame(stream_id, FrameKind::Cancel, encode_status(&status)) {
                    emit(&self.outbound, bytes);
                }
            }
        }
        Ok(())
    }

    /// Answers a new call with a final status without starting it.
    fn refuse(&mut self, stream_id: u32, status: Status) {
        debug!(stream_id, code = %status.code(), message = status.message(), "call refused");
        let trailer = TrailerBlock::with_status(status, Metadata::new());
        if let Ok(bytes) = encode_frame(stream_id, FrameKind::Trailer, trailer.encode()) {
            emit(&self.outbound, bytes);
        }
        self.retire(stream_id, false);
    }

    fn accept(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        self.last_peer_id = stream_id;

        let header = match HeaderBlock::decode(&frame.payload) {
            Ok(header) => header,
            Err(err) => return self.refuse(stream_id, err.into()),
        };
        let Some(acceptor) = self.acceptor.clone() else {
            return self.refuse(
                stream_id,
                Status::unimplemented(format!("{} serves no methods", self.side)),
            );
        };
        let Some(&pattern) = acceptor.methods.get(&header.path) else {
            return self.refuse(
                stream_id,
                Status::unimplemented(format!("unknown method {}", header.path)),
            );
        };
        if self.streams.len() >= self.config.max_concurrent_streams {
            return self.refuse(
                stream_id,
                Status::resource_exhausted(format!("{} calls already open", self.streams.len())),
            );
        }
        let Some(commands) = self.commands.upgrade() else {
            return self.refuse(stream_id, connection_gone());
        };

        let deadline = header.timeout.map(deadline_after);
        debug!(stream_id, path = %header.path, %pattern, "call accepted");
        let (stream, handle, _completion) = self.new_stream(
            stream_id,
            CallState::server(pattern),
            header.path,
            header.metadata,
            deadline,
            commands,
        );
        self.streams.insert(stream_id, stream);

        let status = match acceptor.calls.try_send(handle) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => {
                Status::resource_exhausted("incoming call backlog is full")
            }
            Err(TrySendError::Closed(_)) => Status::unavailable("server is shutting down"),
        };
        self.cancel_stream(stream_id, status, true);
    }

    fn live_frame(&mut self, frame: Frame) {
        let stream_id = frame.stream_id;
        match frame.kind {
            FrameKind::Header => self.on_header(stream_id, &frame.payload),
            FrameKind::Message => self.on_message(stream_id, frame.payload),
            FrameKind::Trailer => self.on_trailer(stream_id, &frame.payload),
            FrameKind::Cancel => {
                let status = decode_status(&frame.payload).unwrap_or_else(Status::from);
                debug!(stream_id, code = %status.code(), "peer cancelled call");
                self.cancel_stream(stream_id, status, false);
            }
            FrameKind::Credit => self.on_credit(stream_id, &frame.payload),
            FrameKind::GoAway => {}
        }
    }

    fn on_header(&mut self, stream_id: u32, payload: &[u8]) {
        let side = self.side;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.state.is_terminal() {
            return;
        }
        if !side.owns(stream_id) {
            return self.cancel_stream(
                stream_id,
                Status::failed_precondition("duplicate request header"),
                true,
            );
        }
        let header = match HeaderBlock::decode(payload) {
            Ok(header) => header,
            Err(err) => return self.cancel_stream(stream_id, err.into(), true),
        };
        if let Err(err) = stream.state.recv_header() {
            return self.cancel_stream(stream_id, err.into(), true);
        }
        let _ = stream.events.send(CallEvent::Header(header.metadata));
    }

    fn on_message(&mut self, stream_id: u32, payload: Vec<u8>) {
        let max = self.config.max_message_size;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        // finished locally and still flushing; the peer has not seen it yet
        if stream.state.is_terminal() {
            return;
        }
        let cost = frame_cost(stream_id, payload.len());
        if let Err(err) = stream.recv_window.receive(cost) {
            return self.cancel_stream(stream_id, err.into(), true);
        }
        if payload.len() > max {
            return self.cancel_stream(
                stream_id,
                Status::resource_exhausted(format!(
                    "message of {} bytes exceeds the {max} byte limit",
                    payload.len()
                )),
                true,
            );
        }
        if let Err(err) = stream.state.recv_message() {
            return self.cancel_stream(stream_id, err.into(), true);
        }
        stream.undelivered += 1;
        let _ = stream.events.send(CallEvent::Message { payload, cost });
    }

    fn on_trailer(&mut self, stream_id: u32, payload: &[u8]) {
        let ours = self.side.owns(stream_id);
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.state.is_terminal() {
            return;
        }
        let trailer = match TrailerBlock::decode(payload) {
            Ok(trailer) => trailer,
            Err(err) => return self.cancel_stream(stream_id, err.into(), true),
        };
        match trailer.status {
            None => {
                if let Err(err) = stream.state.recv_close() {
                    return self.cancel_stream(stream_id, err.into(), true);
                }
                let _ = stream.events.send(CallEvent::HalfClosed);
            }
            Some(_) if !ours => self.cancel_stream(
                stream_id,
                Status::failed_precondition("only the called side ends a call with a status"),
                true,
            ),
            Some(status) => match stream.state.recv_finish(&status) {
                Ok(()) => {
                    debug!(stream_id, code = %status.code(), "call completed");
                    self.end_stream(stream_id, Completion::new(status, trailer.metadata), false);
                    self.retire(stream_id, true);
                }
                // the peer is done either way; fail locally without a CANCEL
                Err(err) => self.cancel_stream(stream_id, err.into(), false),
            },
        }
    }

    fn on_credit(&mut self, stream_id: u32, payload: &[u8]) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let released = decode_credit(payload)
            .map_err(Status::from)
            .and_then(|increment| stream.send_window.release(increment).map_err(Status::from));
        match released {
            Ok(()) => self.flush(stream_id),
            Err(status) => self.cancel_stream(stream_id, status, true),
        }
    }

    fn prune_retired(&mut self) {
        let window = self.config.rearm_window;
        self.retired.retain(|_, retired| retired.at.elapsed() < window);
    }
}

fn transport_failure(err: ProtocolError) -> Shutdown {
    match err {
        ProtocolError::Io(_) | ProtocolError::IncompleteFrame { .. } => {
            Shutdown::Peer(Status::connection_closed(err.to_string()))
        }
        other => Shutdown::Local(Status::wire_format(other.to_string())),
    }
}

async fn read_loop<R>(mut reader: FrameReader<R>, inbound: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = match reader.read_frame().await {
            Ok(Some(frame)) => Inbound::Frame(frame),
            Ok(None) => Inbound::Closed,
            Err(err) => Inbound::Failed(err),
        };
        let last = !matches!(next, Inbound::Frame(_));
        if inbound.send(next).await.is_err() || last {
            break;
        }
    }
    trace!("reader stopped");
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::Sender<Inbound>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        if let Err(err) = writer.write_encoded(&bytes).await {
            warn!(error = %err, "write failed");
            let _ = inbound.send(Inbound::Failed(err)).await;
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "transport shutdown failed");
    }
    trace!("writer stopped");
}
