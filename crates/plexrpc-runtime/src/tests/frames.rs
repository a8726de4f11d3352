//! One real connection against a peer that writes frames by hand.

use std::collections::HashMap;
use std::time::Duration;

use plexrpc_core::{CallPattern, Code, Metadata, Status};
use plexrpc_protocol::{
    Frame, FrameKind, FrameReader, FrameWriter, HeaderBlock, MAX_STREAM_ID, TrailerBlock,
    decode_status, encode_status,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use super::*;
use crate::call::Side;
use crate::client::CallOptions;
use crate::connection::Acceptor;

struct RawPeer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl RawPeer {
    fn new(io: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    async fn send(&mut self, stream_id: u32, kind: FrameKind, payload: Vec<u8>) {
        self.writer
            .write_frame(&Frame::new(stream_id, kind, payload))
            .await
            .unwrap();
    }

    async fn respond(&mut self, stream_id: u32, payload: &[u8]) {
        self.send(stream_id, FrameKind::Header, HeaderBlock::response(Metadata::new()).encode())
            .await;
        self.send(stream_id, FrameKind::Message, payload.to_vec()).await;
    }

    async fn finish(&mut self, stream_id: u32, status: Status) {
        let trailer = TrailerBlock::with_status(status, Metadata::new());
        self.send(stream_id, FrameKind::Trailer, trailer.encode()).await;
    }

    /// Next frame other than CREDIT, `None` once the other end hung up.
    async fn next(&mut self) -> Option<Frame> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
                .await
                .unwrap()
                .unwrap();
            match frame {
                Some(frame) if frame.kind == FrameKind::Credit => continue,
                other => return other,
            }
        }
    }

    async fn expect(&mut self, stream_id: u32, kind: FrameKind) -> Frame {
        let frame = self.next().await.unwrap();
        assert_eq!((frame.stream_id, frame.kind), (stream_id, kind));
        frame
    }

    async fn expect_cancel(&mut self, stream_id: u32) -> Status {
        let frame = self.expect(stream_id, FrameKind::Cancel).await;
        decode_status(&frame.payload).unwrap()
    }
}

fn raw_server(config: ConnectionConfig) -> (Connection, RawPeer) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    (Connection::client(ours, config), RawPeer::new(theirs))
}

/// Opens a unary call and lets the peer answer and finish it with OK.
async fn finished_unary(connection: &Connection, peer: &mut RawPeer, stream_id: u32) {
    let (mut call, completion) = connection
        .open(SAY, CallPattern::Unary, Metadata::new(), None)
        .await
        .unwrap();
    call.send(b"ping".to_vec()).await.unwrap();
    call.close_send().await.unwrap();
    peer.expect(stream_id, FrameKind::Header).await;
    peer.expect(stream_id, FrameKind::Message).await;
    peer.expect(stream_id, FrameKind::Trailer).await;

    peer.respond(stream_id, b"pong").await;
    peer.finish(stream_id, Status::ok()).await;
    assert_eq!(call.message().await.unwrap().as_deref(), Some(&b"pong"[..]));
    assert!(completion.wait().await.status.is_ok());
}

#[tokio::test]
async fn half_close_after_the_server_finished_succeeds() {
    let (connection, mut peer) = raw_server(ConnectionConfig::default());
    let (mut call, completion) = connection
        .open(SAY, CallPattern::Unary, Metadata::new(), None)
        .await
        .unwrap();
    call.send(b"ping".to_vec()).await.unwrap();
    peer.expect(1, FrameKind::Header).await;
    peer.expect(1, FrameKind::Message).await;

    // the whole answer lands before the caller half-closes
    peer.respond(1, b"pong").await;
    peer.finish(1, Status::ok()).await;
    assert!(completion.wait().await.status.is_ok());

    call.close_send().await.unwrap();
    assert_eq!(call.message().await.unwrap().as_deref(), Some(&b"pong"[..]));
    assert!(call.message().await.unwrap().is_none());
    assert_eq!(call.status().map(Status::code), Some(Code::Ok));

    // no half-close or CANCEL went out for the finished call
    connection.close();
    peer.expect(0, FrameKind::GoAway).await;
}

#[tokio::test]
async fn duplicate_trailer_is_ignored() {
    let (connection, mut peer) = raw_server(ConnectionConfig::default());
    finished_unary(&connection, &mut peer, 1).await;

    peer.finish(1, Status::ok()).await;
    // answered in order after the trailer: this end serves nothing, so it refuses
    let header = HeaderBlock::request(SAY, None, Metadata::new());
    peer.send(2, FrameKind::Header, header.encode()).await;

    let refused = peer.expect(2, FrameKind::Trailer).await;
    let trailer = TrailerBlock::decode(&refused.payload).unwrap();
    assert_eq!(trailer.status.map(|status| status.code()), Some(Code::Unimplemented));
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn message_for_a_finished_call_is_cancelled() {
    let (connection, mut peer) = raw_server(ConnectionConfig::default());
    finished_unary(&connection, &mut peer, 1).await;

    peer.send(1, FrameKind::Message, b"late".to_vec()).await;
    let status = peer.expect_cancel(1).await;
    assert_eq!(status.code(), Code::StreamAlreadyClosed);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn frame_for_a_never_opened_stream_closes_the_connection() {
    let (connection, mut peer) = raw_server(ConnectionConfig::default());
    peer.send(9, FrameKind::Message, b"stray".to_vec()).await;

    let goaway = peer.expect(0, FrameKind::GoAway).await;
    assert_eq!(
        decode_status(&goaway.payload).unwrap().code(),
        Code::WireFormatError
    );
    tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .unwrap();
    let err = connection
        .open(SAY, CallPattern::Unary, Metadata::new(), None)
        .await
        .err()
        .unwrap();
    assert!(err.code().is_unavailable());
}

#[tokio::test]
async fn overrunning_the_window_is_a_flow_control_violation() {
    let config = ConnectionConfig::default()
        .with_initial_window(256)
        .with_max_message_size(240);
    let (connection, mut peer) = raw_server(config);
    let (mut call, completion) = connection
        .open(EXPAND, CallPattern::ServerStreaming, Metadata::new(), None)
        .await
        .unwrap();
    peer.expect(1, FrameKind::Header).await;

    // nothing is read, so no credit comes back for the first message
    peer.respond(1, &[1; 200]).await;
    peer.send(1, FrameKind::Message, vec![2; 200]).await;

    let status = peer.expect_cancel(1).await;
    assert_eq!(status.code(), Code::FlowControlViolation);
    assert_eq!(completion.wait().await.status.code(), Code::FlowControlViolation);
    assert_eq!(call.completion().await.status.code(), Code::FlowControlViolation);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn exhausting_stream_ids_closes_the_connection() {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let connection = Connection::spawn_from(
        ours,
        Side::Client,
        ConnectionConfig::default(),
        None,
        MAX_STREAM_ID,
    );
    let mut peer = RawPeer::new(theirs);

    let (_last, _completion) = connection
        .open(CHAT, CallPattern::Bidirectional, Metadata::new(), None)
        .await
        .unwrap();
    peer.expect(MAX_STREAM_ID, FrameKind::Header).await;

    let err = connection
        .open(CHAT, CallPattern::Bidirectional, Metadata::new(), None)
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Code::ResourceExhausted);

    let goaway = peer.expect(0, FrameKind::GoAway).await;
    assert_eq!(
        decode_status(&goaway.payload).unwrap().code(),
        Code::ResourceExhausted
    );
    tokio::time::timeout(Duration::from_secs(5), connection.closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn undecodable_response_cancels_the_call() {
    let (connection, mut peer) = raw_server(ConnectionConfig::default());
    let client = Client::new(connection, registry());
    let mut call = client
        .server_streaming(EXPAND, &request("tick", 2), CallOptions::new())
        .await
        .unwrap();
    peer.expect(1, FrameKind::Header).await;
    peer.expect(1, FrameKind::Message).await;
    peer.expect(1, FrameKind::Trailer).await;

    // field 1 claims five bytes and carries one
    peer.respond(1, &[0x0a, 0x05, b'h']).await;

    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Code::WireFormatError);
    assert_eq!(peer.expect_cancel(1).await.code(), Code::WireFormatError);
    assert_eq!(call.completion().await.status.code(), Code::WireFormatError);
}

#[tokio::test]
async fn undecodable_request_cancels_the_call() {
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let router = Router::builder(registry())
        .bidirectional(CHAT, move |mut requests, _sink| {
            let observed = observed_tx.clone();
            async move {
                let result = requests.message().await;
                let _ = observed.send(result.as_ref().err().map(Status::code));
                result.map(|_| ())
            }
        })
        .build()
        .unwrap();
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let server = Server::new(router, ConnectionConfig::default()).unwrap();
    tokio::spawn(async move { server.serve_connection(ours).await });
    let mut peer = RawPeer::new(theirs);

    let header = HeaderBlock::request(CHAT, None, Metadata::new());
    peer.send(1, FrameKind::Header, header.encode()).await;
    peer.send(1, FrameKind::Message, vec![0x0a, 0x05, b'h']).await;

    assert_eq!(observed_rx.recv().await.unwrap(), Some(Code::WireFormatError));
    assert_eq!(peer.expect_cancel(1).await.code(), Code::WireFormatError);
}

#[tokio::test(start_paused = true)]
async fn finish_parked_behind_credit_survives_a_cancel() {
    let config = ConnectionConfig::default()
        .with_initial_window(256)
        .with_max_message_size(240);
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (calls_tx, mut calls_rx) = mpsc::channel(4);
    let methods: Arc<HashMap<String, CallPattern>> =
        Arc::new([(EXPAND.to_owned(), CallPattern::ServerStreaming)].into_iter().collect());
    let _server = Connection::spawn(
        ours,
        Side::Server,
        config,
        Some(Acceptor::new(methods, calls_tx)),
    );
    let mut peer = RawPeer::new(theirs);

    let header = HeaderBlock::request(EXPAND, None, Metadata::new());
    peer.send(1, FrameKind::Header, header.encode()).await;
    peer.send(1, FrameKind::Message, b"go".to_vec()).await;
    peer.send(1, FrameKind::Trailer, TrailerBlock::half_close().encode()).await;

    let (_info, sender, mut receiver) = calls_rx.recv().await.unwrap().into_split();
    sender.send(vec![1; 200]).await.unwrap();
    // the second message waits for credit that never comes
    assert!(
        tokio::time::timeout(Duration::from_millis(50), sender.send(vec![2; 200]))
            .await
            .is_err()
    );
    sender.finish(Status::ok(), Metadata::new()).await.unwrap();

    peer.expect(1, FrameKind::Header).await;
    peer.expect(1, FrameKind::Message).await;
    let cancel = Status::cancelled("gave up waiting");
    peer.send(1, FrameKind::Cancel, encode_status(&cancel)).await;

    assert_eq!(receiver.completion().await.status.code(), Code::Ok);
}
