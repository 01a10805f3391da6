use std::convert::Infallible;
use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::routing::{get, post};
use futures_lite::StreamExt;
use h2::Reason;
use sluice::bytes::Bytes;
use sluice::http::{Request, Response};
use sluice::{
    AsyncHttpClient, BodyProducer, ClientConfig, EmptyBody, GoAwayError, Protocol, StreamReset,
    TransportError,
};
use sluice_mocks::{MockTransport, Recorded, RecordingHandler};
use sluice_tokio::TokioRuntime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

type Client = AsyncHttpClient<MockTransport, TokioRuntime>;

fn app() -> axum::Router {
    axum::Router::new()
        .route("/", get(async || "hello"))
        .route(
            "/slow",
            get(async || {
                tokio::time::sleep(Duration::from_millis(100)).await;
                "slow"
            }),
        )
        .route("/echo", post(async |body: Bytes| body))
        .route(
            "/stall",
            get(async || {
                let partial = Ok::<_, Infallible>(Bytes::from_static(b"partial"));
                let parts =
                    futures_lite::stream::once(partial).chain(futures_lite::stream::pending());
                Body::from_stream(parts)
            }),
        )
}

fn client(transport: MockTransport, config: ClientConfig) -> Client {
    AsyncHttpClient::new(transport, TokioRuntime, config)
}

fn get_request(path: &str) -> Request<()> {
    Request::get(format!("http://mock.local{path}")).body(()).unwrap()
}

async fn send(
    client: &Client,
    request: Request<()>,
    producer: impl BodyProducer,
) -> RecordingHandler {
    let handler = RecordingHandler::new();
    client.execute(request, producer, handler.clone()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handler.finished())
        .await
        .expect("request did not finish");
    handler
}

#[tokio::test]
async fn hello_h2_over_alpn() {
    let client = client(MockTransport::router_h2(app(), 100), ClientConfig::default());

    let handler = send(&client, get_request("/"), EmptyBody).await;

    assert!(handler.is_complete(), "{:?}", handler.error_message());
    assert_eq!(
        handler.events(),
        [
            Recorded::Headers(handler.head().unwrap()),
            Recorded::Stream(Bytes::from_static(b"hello")),
            Recorded::Complete,
        ]
    );
}

#[tokio::test]
async fn prior_knowledge_h2_without_alpn() {
    let transport = MockTransport::router(app());
    let client = client(transport, ClientConfig::default().with_protocol(Protocol::Http2));

    let handler = send(&client, get_request("/"), EmptyBody).await;

    assert!(handler.is_complete(), "{:?}", handler.error_message());
    assert_eq!(handler.body(), b"hello".as_slice());
}

#[tokio::test]
async fn request_body_is_streamed_to_the_server() {
    let client = client(MockTransport::router_h2(app(), 100), ClientConfig::default());
    let request = Request::post("http://mock.local/echo").body(()).unwrap();

    let handler = send(&client, request, Bytes::from(vec![b'x'; 100_000])).await;

    assert!(handler.is_complete(), "{:?}", handler.error_message());
    assert_eq!(handler.body().len(), 100_000);
}

#[tokio::test]
async fn saturated_connection_spills_onto_a_second_one() {
    let transport = MockTransport::router_h2(app(), 100);
    let client = client(
        transport.clone(),
        ClientConfig::default().with_max_streams_per_connection(2),
    );

    let handlers: Vec<_> = (0..3)
        .map(|_| {
            let handler = RecordingHandler::new();
            client
                .execute(get_request("/slow"), EmptyBody, handler.clone())
                .unwrap();
            handler
        })
        .collect();
    for handler in &handlers {
        tokio::time::timeout(Duration::from_secs(5), handler.finished())
            .await
            .unwrap();
        assert_eq!(handler.body(), b"slow".as_slice());
    }

    assert_eq!(transport.connects(), 2);

    let next = send(&client, get_request("/"), EmptyBody).await;
    assert!(next.is_complete());
    assert_eq!(transport.connects(), 2);
}

async fn reset_or_hello(
    request: Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
) {
    let response = Response::builder().status(200).body(()).unwrap();
    if request.uri().path() == "/reset" {
        let Ok(mut stream) = respond.send_response(response, false) else {
            return;
        };
        let _ = stream.send_data(Bytes::from_static(b"partial"), false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.send_reset(Reason::CANCEL);
    } else if let Ok(mut stream) = respond.send_response(response, false) {
        let _ = stream.send_data(Bytes::from_static(b"ok"), true);
    }
}

#[tokio::test]
async fn rst_stream_cancel_is_reported_and_frees_the_slot() {
    let transport = MockTransport::h2(100, reset_or_hello);
    let client = client(
        transport.clone(),
        ClientConfig::default().with_max_streams_per_connection(1),
    );

    let reset = send(&client, get_request("/reset"), EmptyBody).await;

    assert_eq!(reset.status(), Some(200));
    assert_eq!(reset.terminal_count(), 1);
    let error = reset.error::<StreamReset>().expect("stream reset");
    assert_eq!(error.code, 8);
    assert_eq!(error.name(), "CANCEL");
    assert!(reset.error_message().unwrap().contains("CANCEL(8)"));

    let next = send(&client, get_request("/"), EmptyBody).await;
    assert!(next.is_complete(), "{:?}", next.error_message());
    assert_eq!(next.body(), b"ok".as_slice());
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn abort_resets_only_the_stream() {
    let transport = MockTransport::router_h2(app(), 100);
    let client = client(transport.clone(), ClientConfig::default());
    let handler = RecordingHandler::new();

    let executor = client
        .execute(get_request("/stall"), EmptyBody, handler.clone())
        .unwrap();
    while handler.status().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    executor.abort();
    handler.finished().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handler.terminal_count(), 1);
    assert!(handler.error_is(|error: &TransportError| {
        matches!(error, TransportError::Aborted)
    }));

    let next = send(&client, get_request("/"), EmptyBody).await;
    assert!(next.is_complete());
    assert_eq!(transport.connects(), 1);
}

async fn long_or_hello(
    request: Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
) {
    let body = if request.uri().path() == "/long" {
        tokio::time::sleep(Duration::from_millis(300)).await;
        "long"
    } else {
        "ok"
    };
    let response = Response::builder().status(200).body(()).unwrap();
    if let Ok(mut stream) = respond.send_response(response, false) {
        let _ = stream.send_data(Bytes::from_static(body.as_bytes()), true);
    }
}

/// Serves the first stream of each connection, then shuts the connection
/// down gracefully.
fn shut_down_after_first_stream(io: DuplexStream) {
    tokio::spawn(async move {
        let Ok(mut connection) = h2::server::handshake(io).await else {
            return;
        };
        let mut first = true;
        while let Some(Ok((request, respond))) = connection.accept().await {
            tokio::spawn(long_or_hello(request, respond));
            if std::mem::take(&mut first) {
                connection.graceful_shutdown();
            }
        }
    });
}

#[tokio::test]
async fn graceful_go_away_finishes_in_flight_streams_and_moves_new_ones() {
    let transport = MockTransport::new(shut_down_after_first_stream).with_alpn(b"h2");
    let client = client(transport.clone(), ClientConfig::default());
    let long = RecordingHandler::new();

    client
        .execute(get_request("/long"), EmptyBody, long.clone())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let next = send(&client, get_request("/"), EmptyBody).await;

    assert!(next.is_complete(), "{:?}", next.error_message());
    assert_eq!(next.body(), b"ok".as_slice());
    tokio::time::timeout(Duration::from_secs(5), long.finished())
        .await
        .expect("in-flight request did not finish");
    assert!(long.is_complete(), "{:?}", long.error_message());
    assert_eq!(long.body(), b"long".as_slice());
    assert_eq!(transport.connects(), 2);
}

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const SETTINGS: u8 = 0x4;
const GOAWAY: u8 = 0x7;
const END_STREAM: u8 = 0x1;
const ACK: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
/// HPACK static table entry 8, `:status: 200`.
const STATUS_200: u8 = 0x88;

struct RawFrame {
    kind: u8,
    flags: u8,
    stream_id: u32,
}

async fn read_frame(io: &mut DuplexStream) -> io::Result<RawFrame> {
    let mut head = [0; 9];
    io.read_exact(&mut head).await?;
    let len = u32::from_be_bytes([0, head[0], head[1], head[2]]) as usize;
    let mut payload = vec![0; len];
    io.read_exact(&mut payload).await?;
    Ok(RawFrame {
        kind: head[3],
        flags: head[4],
        stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
    })
}

async fn write_frame(
    io: &mut DuplexStream,
    kind: u8,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> io::Result<()> {
    let len = (payload.len() as u32).to_be_bytes();
    let mut frame = vec![len[1], len[2], len[3], kind, flags];
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.extend_from_slice(payload);
    io.write_all(&frame).await
}

/// Reads the client preface and sends empty server settings.
async fn accept_raw(io: &mut DuplexStream) -> io::Result<()> {
    let mut preface = [0; 24];
    io.read_exact(&mut preface).await?;
    write_frame(io, SETTINGS, 0, 0, &[]).await
}

/// Stream id of the next request, acknowledging client settings on the way.
async fn next_request(io: &mut DuplexStream) -> io::Result<u32> {
    loop {
        let frame = read_frame(io).await?;
        match frame.kind {
            SETTINGS if frame.flags & ACK == 0 => write_frame(io, SETTINGS, ACK, 0, &[]).await?,
            HEADERS => return Ok(frame.stream_id),
            _ => {}
        }
    }
}

async fn respond_ok(io: &mut DuplexStream, stream_id: u32) -> io::Result<()> {
    write_frame(io, HEADERS, END_HEADERS, stream_id, &[STATUS_200]).await?;
    write_frame(io, DATA, END_STREAM, stream_id, b"ok").await
}

/// Refuses every stream after the first with `GOAWAY`, then answers the
/// first one.
async fn keep_only_first_stream(mut io: DuplexStream) -> io::Result<()> {
    accept_raw(&mut io).await?;
    let first = next_request(&mut io).await?;
    next_request(&mut io).await?;
    let mut go_away = first.to_be_bytes().to_vec();
    go_away.extend_from_slice(&0u32.to_be_bytes());
    write_frame(&mut io, GOAWAY, 0, 0, &go_away).await?;
    respond_ok(&mut io, first).await?;
    while read_frame(&mut io).await.is_ok() {}
    Ok(())
}

/// Answers the first request and hangs up right after the last byte.
async fn answer_and_hang_up(mut io: DuplexStream) -> io::Result<()> {
    accept_raw(&mut io).await?;
    let stream_id = next_request(&mut io).await?;
    respond_ok(&mut io, stream_id).await
}

#[tokio::test]
async fn go_away_below_an_open_stream_fails_only_that_stream() {
    let transport = MockTransport::new(|io| {
        tokio::spawn(keep_only_first_stream(io));
    })
    .with_alpn(b"h2");
    let client = client(transport.clone(), ClientConfig::default());
    let first = RecordingHandler::new();

    client
        .execute(get_request("/first"), EmptyBody, first.clone())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = send(&client, get_request("/second"), EmptyBody).await;
    tokio::time::timeout(Duration::from_secs(5), first.finished())
        .await
        .expect("first request did not finish");

    assert!(first.is_complete(), "{:?}", first.error_message());
    assert_eq!(first.body(), b"ok".as_slice());
    assert_eq!(second.terminal_count(), 1);
    assert_eq!(second.error::<GoAwayError>(), Some(GoAwayError::new(3, 0)));
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn response_received_before_the_peer_hangs_up_completes() {
    let transport = MockTransport::new(|io| {
        tokio::spawn(answer_and_hang_up(io));
    })
    .with_alpn(b"h2");
    let client = client(transport.clone(), ClientConfig::default());

    let handler = send(&client, get_request("/"), EmptyBody).await;

    assert!(handler.is_complete(), "{:?}", handler.error_message());
    assert_eq!(handler.terminal_count(), 1);
    assert_eq!(handler.status(), Some(200));
    assert_eq!(handler.body(), b"ok".as_slice());
}
