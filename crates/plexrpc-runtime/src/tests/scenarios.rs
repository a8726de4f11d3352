use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plexrpc_core::{CallPattern, Code, Metadata, Status};
use tokio::sync::{mpsc, oneshot};

use super::*;
use crate::call::Side;
use crate::client::CallOptions;
use crate::connection::Acceptor;
use crate::interceptor::{BoxFuture, CallContext, Interceptor, LoggingInterceptor, Next};

#[tokio::test]
async fn unary_echo() {
    let client = connect_echo();
    let response = client
        .unary(SAY, &request("hello", 0), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.message().get_str("text"), "hello");
    assert!(response.trailers().is_empty());
}

#[tokio::test]
async fn back_to_back_unary_calls_all_succeed() {
    let client = connect_echo();
    for n in 0..200 {
        let text = n.to_string();
        let response = client
            .unary(SAY, &request(&text, 0), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(response.message().get_str("text"), text);
    }

    let mut call = client
        .server_streaming(EXPAND, &request("once", 1), CallOptions::new())
        .await
        .unwrap();
    assert!(call.message().await.unwrap().is_some());
    assert!(call.message().await.unwrap().is_none());
}

#[tokio::test]
async fn server_streaming_delivers_in_order() {
    let client = connect_echo();
    let mut call = client
        .server_streaming(EXPAND, &request("tick", 3), CallOptions::new())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Some(message) = call.message().await.unwrap() {
        seen.push((message.get_str("text").to_owned(), message.get_u64("index")));
    }
    assert_eq!(
        seen,
        [
            ("tick".to_owned(), 0),
            ("tick".to_owned(), 1),
            ("tick".to_owned(), 2)
        ]
    );
    assert_eq!(call.status().map(Status::code), Some(Code::Ok));
}

#[tokio::test]
async fn client_streaming_collects() {
    let client = connect_echo();
    let call = client
        .client_streaming(COLLECT, CallOptions::new())
        .await
        .unwrap();
    for word in ["one", "two", "three"] {
        call.send(&request(word, 0)).await.unwrap();
    }
    let response = call.finish().await.unwrap();
    assert_eq!(response.message().get_str("text"), "one two three");
    assert_eq!(response.message().get_u64("index"), 3);
}

#[tokio::test]
async fn bidirectional_answers_as_messages_arrive() {
    let client = connect_echo();
    let mut call = client.bidirectional(CHAT, CallOptions::new()).await.unwrap();

    call.send(&request("ping", 0)).await.unwrap();
    let first = call.message().await.unwrap().unwrap();
    assert_eq!(first.get_str("text"), "ping");

    call.send(&request("pong", 0)).await.unwrap();
    let second = call.message().await.unwrap().unwrap();
    assert_eq!(second.get_u64("index"), 1);

    call.close_send().await.unwrap();
    assert!(call.message().await.unwrap().is_none());
    assert!(call.completion().await.status.is_ok());
}

#[tokio::test]
async fn calls_share_one_connection() {
    let client = connect_echo();
    let calls = (0..16).map(|n| {
        let client = client.clone();
        async move {
            let text = format!("call-{n}");
            let response = client
                .unary(SAY, &request(&text, 0), CallOptions::new())
                .await
                .unwrap();
            assert_eq!(response.message().get_str("text"), text);
        }
    });
    futures_util::future::join_all(calls).await;
}

#[tokio::test(start_paused = true)]
async fn a_slow_call_does_not_hold_up_the_others() {
    let router = echo_router()
        .unary(MISSING, |request| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            reply(request.message().get_str("text"), 0)
        })
        .build()
        .unwrap();
    let client = connect(router, ConnectionConfig::default());
    let started = tokio::time::Instant::now();

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .unary(MISSING, &request("slow", 0), CallOptions::new())
                .await
        })
    };
    let quick = ["one", "two", "three"].map(|text| {
        let client = client.clone();
        async move {
            client
                .unary(SAY, &request(text, 0), CallOptions::new())
                .await
                .unwrap()
        }
    });
    let replies = futures_util::future::join_all(quick).await;
    let texts: Vec<_> = replies
        .iter()
        .map(|response| response.message().get_str("text"))
        .collect();
    assert_eq!(texts, ["one", "two", "three"]);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.message().get_str("text"), "slow");
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test]
async fn unrouted_method_is_unimplemented() {
    let client = connect_echo();
    let err = client
        .unary(MISSING, &request("x", 0), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    // the connection survives
    let response = client
        .unary(SAY, &request("still here", 0), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.message().get_str("text"), "still here");
}

fn explode() -> Result<(), Status> {
    panic!("handler bug")
}

#[tokio::test]
async fn handler_panic_becomes_internal() {
    let router = echo_router()
        .unary(MISSING, |_request| async move {
            explode()?;
            reply("unreachable", 0)
        })
        .build()
        .unwrap();
    let client = connect(router, ConnectionConfig::default());

    let err = client
        .unary(MISSING, &request("boom", 0), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    let response = client
        .unary(SAY, &request("after", 0), CallOptions::new())
        .await
        .unwrap();
    assert_eq!(response.message().get_str("text"), "after");
}

#[tokio::test]
async fn handler_error_reaches_the_caller() {
    let router = echo_router()
        .unary(MISSING, |request| async move {
            Err::<DynamicMessage, _>(Status::not_found(format!(
                "no record for {}",
                request.message().get_str("text")
            )))
        })
        .build()
        .unwrap();
    let client = connect(router, ConnectionConfig::default());

    let err = client
        .unary(MISSING, &request("42", 0), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), "no record for 42");
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_the_handler() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let observed = Arc::new(Mutex::new(Some(observed_tx)));
    let router = echo_router()
        .unary(MISSING, move |request| {
            let observed = observed.clone();
            async move {
                let status = request.context().cancelled().await;
                if let Some(tx) = observed.lock().unwrap().take() {
                    let _ = tx.send(status.code());
                }
                Err::<DynamicMessage, _>(status)
            }
        })
        .build()
        .unwrap();
    let client = connect(router, ConnectionConfig::default());

    let started = tokio::time::Instant::now();
    let err = client
        .unary(
            MISSING,
            &request("slow", 0),
            CallOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(
        elapsed >= Duration::from_millis(45) && elapsed < Duration::from_millis(100),
        "failed after {elapsed:?}"
    );
    assert_eq!(observed_rx.await.unwrap(), Code::DeadlineExceeded);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_stream_cancels_the_server_side() {
    let (observed_tx, mut observed_rx) = mpsc::unbounded_channel();
    let router = Router::builder(registry())
        .bidirectional(CHAT, move |mut requests, sink| {
            let observed = observed_tx.clone();
            async move {
                let first = requests.message().await?.unwrap_or_else(|| request("", 0));
                sink.send(&reply(first.get_str("text"), 0)?).await?;
                let result = requests.message().await;
                let _ = observed.send(result.err().map(|status| status.code()));
                Ok::<_, Status>(())
            }
        })
        .build()
        .unwrap();
    let client = connect(router, ConnectionConfig::default());

    let mut call = client.bidirectional(CHAT, CallOptions::new()).await.unwrap();
    call.send(&request("hi", 0)).await.unwrap();
    assert_eq!(call.message().await.unwrap().unwrap().get_str("text"), "hi");
    drop(call);

    assert_eq!(observed_rx.recv().await.unwrap(), Some(Code::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn explicit_cancel_reports_cancelled() {
    let client = connect_echo();
    let mut call = client.bidirectional(CHAT, CallOptions::new()).await.unwrap();
    call.cancel();
    let completion = call.completion().await;
    assert_eq!(completion.status.code(), Code::Cancelled);
    assert_eq!(call.status().map(Status::code), Some(Code::Cancelled));
    assert!(call.send(&request("late", 0)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn handler_ignoring_cancellation_is_dropped_after_grace() {
    let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
    let dropped = Arc::new(Mutex::new(Some(dropped_tx)));
    let router = echo_router()
        .unary(MISSING, move |_request| {
            let guard = DropSignal(dropped.lock().unwrap().take());
            async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                reply("never", 0)
            }
        })
        .build()
        .unwrap();
    let config = ConnectionConfig::default().with_cancel_grace(Duration::from_millis(100));
    let client = connect(router, config);

    let err = client
        .unary(
            MISSING,
            &request("stuck", 0),
            CallOptions::new().with_timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    tokio::time::timeout(Duration::from_secs(1), dropped_rx)
        .await
        .expect("handler dropped after grace")
        .ok();
}

struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

type Log = Arc<Mutex<Vec<String>>>;

struct Tag {
    name: &'static str,
    log: Log,
}

impl Interceptor for Tag {
    fn intercept<'a>(&'a self, ctx: &'a mut CallContext, next: Next<'a>) -> BoxFuture<'a, Status> {
        Box::pin(async move {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}-in", ctx.side(), self.name));
            if ctx.side() == Side::Client {
                ctx.metadata_mut().append("x-via", self.name).unwrap();
            } else {
                ctx.trailers_mut().append("x-served-by", self.name).unwrap();
            }
            let status = next.run(ctx).await;
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}-out:{}", ctx.side(), self.name, status.code()));
            status
        })
    }
}

#[tokio::test]
async fn interceptors_wrap_both_sides() {
    let log = Log::default();
    let seen = Log::default();
    let handler_seen = seen.clone();
    let router = Router::builder(registry())
        .interceptor(Tag { name: "S1", log: log.clone() })
        .interceptor(Tag { name: "S2", log: log.clone() })
        .unary(SAY, move |request| {
            let seen = handler_seen.clone();
            async move {
                let via: Vec<String> = request
                    .context()
                    .metadata()
                    .get_all("x-via")
                    .filter_map(|value| value.as_text().map(str::to_owned))
                    .collect();
                seen.lock().unwrap().extend(via);
                reply(request.message().get_str("text"), 0)
            }
        })
        .build()
        .unwrap();
    let client = connect(router, ConnectionConfig::default())
        .with_interceptor(Tag { name: "C1", log: log.clone() })
        .with_interceptor(Tag { name: "C2", log: log.clone() })
        .with_interceptor(LoggingInterceptor);

    let response = client
        .unary(SAY, &request("layers", 0), CallOptions::new())
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), ["C1", "C2"]);
    let served_by: Vec<&str> = response
        .trailers()
        .get_all("x-served-by")
        .filter_map(|value| value.as_text())
        .collect();
    assert_eq!(served_by, ["S1", "S2"]);
    let log = log.lock().unwrap().clone();
    insta::assert_debug_snapshot!(log, @r#"
    [
        "client:C1-in",
        "client:C2-in",
        "server:S1-in",
        "server:S2-in",
        "server:S2-out:OK",
        "server:S1-out:OK",
        "client:C2-out:OK",
        "client:C1-out:OK",
    ]
    "#);
}

struct Deny;

impl Interceptor for Deny {
    fn intercept<'a>(&'a self, ctx: &'a mut CallContext, next: Next<'a>) -> BoxFuture<'a, Status> {
        Box::pin(async move {
            if ctx.metadata().get_text("authorization") == Some("letmein") {
                next.run(ctx).await
            } else {
                Status::failed_precondition("not authorized")
            }
        })
    }
}

#[tokio::test]
async fn server_interceptor_short_circuits_streaming_calls() {
    let client = connect(
        echo_router().interceptor(Deny).build().unwrap(),
        ConnectionConfig::default(),
    );

    let mut call = client
        .server_streaming(EXPAND, &request("x", 2), CallOptions::new())
        .await
        .unwrap();
    let err = call.message().await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let mut metadata = Metadata::new();
    metadata.append("authorization", "letmein").unwrap();
    let mut call = client
        .server_streaming(
            EXPAND,
            &request("x", 2),
            CallOptions::new().with_metadata(metadata),
        )
        .await
        .unwrap();
    let mut count = 0;
    while call.message().await.unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 2);
}

#[tokio::test]
async fn client_interceptor_short_circuit_never_opens_a_call() {
    let client = connect_echo().with_interceptor(Deny);
    let err = client
        .bidirectional(CHAT, CallOptions::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = client
        .unary(SAY, &request("x", 0), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.message(), "not authorized");
}

#[tokio::test]
async fn stream_limit_rejects_extra_calls() {
    let config = ConnectionConfig::default().with_max_concurrent_streams(1);
    let client = connect(echo_router().build().unwrap(), config);

    let _open = client.bidirectional(CHAT, CallOptions::new()).await.unwrap();
    let err = client
        .bidirectional(CHAT, CallOptions::new())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), Code::ResourceExhausted);
}

#[tokio::test]
async fn server_can_call_the_client() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let (calls_tx, mut calls_rx) = mpsc::channel(4);
    let methods: Arc<HashMap<String, CallPattern>> =
        Arc::new([(SAY.to_owned(), CallPattern::Unary)].into_iter().collect());
    let _client_end = Connection::spawn(
        client_io,
        Side::Client,
        ConnectionConfig::default(),
        Some(Acceptor::new(methods, calls_tx)),
    );
    let server_end =
        Connection::spawn(server_io, Side::Server, ConnectionConfig::default(), None);

    let callee = tokio::spawn(async move {
        let mut call = calls_rx.recv().await.unwrap();
        assert_eq!(call.info().path(), SAY);
        let payload = call.message().await.unwrap().unwrap();
        call.send(payload).await.unwrap();
        call.finish(Status::ok(), Metadata::new()).await.unwrap();
    });

    let (mut call, completion) = server_end
        .open(SAY, CallPattern::Unary, Metadata::new(), None)
        .await
        .unwrap();
    assert_eq!(call.stream_id(), 2);
    call.send(b"raw".to_vec()).await.unwrap();
    call.close_send().await.unwrap();
    assert_eq!(call.message().await.unwrap().as_deref(), Some(&b"raw"[..]));
    assert!(completion.wait().await.status.is_ok());
    callee.await.unwrap();
}

#[tokio::test]
async fn client_without_methods_refuses_server_calls() {
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let _client_end = Connection::client(client_io, ConnectionConfig::default());
    let server_end =
        Connection::spawn(server_io, Side::Server, ConnectionConfig::default(), None);

    let (mut call, _completion) = server_end
        .open(SAY, CallPattern::Unary, Metadata::new(), None)
        .await
        .unwrap();
    let completion = call.completion().await;
    assert_eq!(completion.status.code(), Code::Unimplemented);
}

#[tokio::test]
async fn closing_the_connection_fails_open_calls() {
    let client = connect_echo();
    let mut call = client.bidirectional(CHAT, CallOptions::new()).await.unwrap();
    client.connection().close();

    let completion = call.completion().await;
    assert!(completion.status.code().is_unavailable());
    client.connection().closed().await;
    assert!(client.connection().is_closed());

    let err = client
        .unary(SAY, &request("x", 0), CallOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ConnectionClosed);
}
