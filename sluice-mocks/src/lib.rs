//! In-memory test doubles for `sluice`.
//!
//! Transports here hand the client one end of a `tokio::io::duplex` pipe
//! and give the other end to a real server (hyper via `axum`, or a raw `h2`
//! server when a test needs to misbehave at the frame level).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_lite::io::{AsyncRead, AsyncWrite};
use h2::RecvStream;
use h2::server::SendResponse;
use http::{Request, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::debug;

use sluice::transport::{BidiStream, TransportPlugin};
use sluice::{ResponseHandler, ResponseHead, StreamedBody};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Client end of an in-memory pipe.
pub struct MockIo {
    inner: Compat<DuplexStream>,
    alpn: Option<Vec<u8>>,
}

impl AsyncRead for MockIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

impl BidiStream for MockIo {
    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }
}

type Serve = Arc<dyn Fn(DuplexStream) + Send + Sync>;

/// A transport whose every connection is served in-process.
#[derive(Clone)]
pub struct MockTransport {
    serve: Serve,
    alpn: Option<Vec<u8>>,
    connects: Arc<AtomicUsize>,
}

impl MockTransport {
    /// `serve` receives the server end of each new connection and must not
    /// block; spawn the server onto the runtime.
    pub fn new(serve: impl Fn(DuplexStream) + Send + Sync + 'static) -> Self {
        Self {
            serve: Arc::new(serve),
            alpn: None,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serves `router` over HTTP/1.1 or HTTP/2, whichever the client speaks.
    pub fn router(router: axum::Router) -> Self {
        Self::new(move |io| serve_router(router.clone(), io, None))
    }

    /// Serves `router` and reports `h2` as the negotiated ALPN protocol.
    /// The server allows `max_concurrent_streams` streams per connection.
    pub fn router_h2(router: axum::Router, max_concurrent_streams: u32) -> Self {
        Self::new(move |io| serve_router(router.clone(), io, Some(max_concurrent_streams)))
            .with_alpn(b"h2")
    }

    /// Serves every stream with `handler` on a raw `h2` server and reports
    /// `h2` as the negotiated ALPN protocol.
    pub fn h2<F, Fut>(max_concurrent_streams: u32, handler: F) -> Self
    where
        F: Fn(Request<RecvStream>, SendResponse<Bytes>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(move |io| serve_h2(io, max_concurrent_streams, handler.clone())).with_alpn(b"h2")
    }

    pub fn with_alpn(mut self, protocol: &[u8]) -> Self {
        self.alpn = Some(protocol.to_vec());
        self
    }

    /// Connections opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl TransportPlugin for MockTransport {
    type Io = MockIo;

    async fn connect(&self, uri: &Uri) -> anyhow::Result<MockIo> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let count = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%uri, connection = count, "mock connection opened");
        (self.serve)(server);
        Ok(MockIo {
            inner: client.compat(),
            alpn: self.alpn.clone(),
        })
    }
}

fn serve_router(router: axum::Router, io: DuplexStream, max_concurrent_streams: Option<u32>) {
    tokio::spawn(async move {
        let mut builder = auto::Builder::new(TokioExecutor::new());
        if let Some(max) = max_concurrent_streams {
            builder.http2().max_concurrent_streams(max);
        }
        let service = TowerToHyperService::new(router);
        if let Err(error) = builder.serve_connection(TokioIo::new(io), service).await {
            debug!(%error, "mock server connection ended with an error");
        }
    });
}

fn serve_h2<F, Fut>(io: DuplexStream, max_concurrent_streams: u32, handler: F)
where
    F: Fn(Request<RecvStream>, SendResponse<Bytes>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let handshake = h2::server::Builder::new()
            .max_concurrent_streams(max_concurrent_streams)
            .handshake::<_, Bytes>(io);
        let mut connection = match handshake.await {
            Ok(connection) => connection,
            Err(error) => {
                debug!(%error, "mock h2 handshake failed");
                return;
            }
        };
        while let Some(accepted) = connection.accept().await {
            match accepted {
                Ok((request, respond)) => {
                    tokio::spawn(handler(request, respond));
                }
                Err(error) => {
                    debug!(%error, "mock h2 connection failed");
                    break;
                }
            }
        }
    });
}

/// A transport that never connects.
#[derive(Clone, Default)]
pub struct FailingTransport {
    attempts: Arc<AtomicUsize>,
}

impl FailingTransport {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl TransportPlugin for FailingTransport {
    type Io = MockIo;

    async fn connect(&self, uri: &Uri) -> anyhow::Result<MockIo> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("connection to {uri} refused")
    }
}

/// One callback seen by a [`RecordingHandler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Headers(ResponseHead),
    Body(Bytes),
    Stream(Bytes),
    Error(String),
    Complete,
}

#[derive(Default)]
struct State {
    events: Vec<Recorded>,
    errors: Vec<anyhow::Error>,
}

struct Inner {
    state: Mutex<State>,
    finished: watch::Sender<bool>,
}

/// A [`ResponseHandler`] that records its callbacks and can be awaited.
#[derive(Clone)]
pub struct RecordingHandler {
    inner: Arc<Inner>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                finished: watch::channel(false).0,
            }),
        }
    }
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once `complete` or `exception_occurred` was called.
    pub async fn finished(&self) {
        let mut finished = self.inner.finished.subscribe();
        let _ = finished.wait_for(|finished| *finished).await;
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.lock().events.clone()
    }

    pub fn head(&self) -> Option<ResponseHead> {
        self.lock().events.iter().find_map(|event| match event {
            Recorded::Headers(head) => Some(head.clone()),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<u16> {
        self.head().map(|head| head.status_code())
    }

    /// Every body byte received, in order.
    pub fn body(&self) -> Bytes {
        let mut body = BytesMut::new();
        for event in &self.lock().events {
            if let Recorded::Body(part) | Recorded::Stream(part) = event {
                body.extend_from_slice(part);
            }
        }
        body.freeze()
    }

    pub fn is_complete(&self) -> bool {
        self.lock().events.contains(&Recorded::Complete)
    }

    /// Number of `complete` and `exception_occurred` calls.
    pub fn terminal_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|event| matches!(event, Recorded::Complete | Recorded::Error(_)))
            .count()
    }

    /// The first reported error, rendered with its causes.
    pub fn error_message(&self) -> Option<String> {
        self.lock().errors.first().map(|error| format!("{error:#}"))
    }

    /// The first reported error of type `T`.
    pub fn error<T>(&self) -> Option<T>
    where
        T: std::error::Error + Clone + Send + Sync + 'static,
    {
        self.lock()
            .errors
            .iter()
            .find_map(|error| error.downcast_ref::<T>().cloned())
    }

    pub fn error_is<T>(&self, predicate: impl Fn(&T) -> bool) -> bool
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.lock()
            .errors
            .iter()
            .any(|error| error.downcast_ref::<T>().is_some_and(&predicate))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: Recorded) {
        self.lock().events.push(event);
    }

    fn finish(&self) {
        self.inner.finished.send_replace(true);
    }
}

impl ResponseHandler for RecordingHandler {
    fn headers_received(&self, response: ResponseHead) {
        self.push(Recorded::Headers(response));
    }

    fn body_part_received(&self, part: Bytes) {
        self.push(Recorded::Body(part));
    }

    fn on_stream(&self, body: StreamedBody) {
        self.push(Recorded::Stream(body.into_bytes()));
    }

    fn exception_occurred(&self, error: anyhow::Error) {
        {
            let mut state = self.lock();
            state.events.push(Recorded::Error(error.to_string()));
            state.errors.push(error);
        }
        self.finish();
    }

    fn complete(&self) {
        self.push(Recorded::Complete);
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_handler_wakes_waiters_on_completion() {
        let handler = RecordingHandler::new();
        let waiting = tokio::spawn({
            let handler = handler.clone();
            async move { handler.finished().await }
        });

        handler.headers_received(ResponseHead::new(200, "OK", Default::default()));
        handler.body_part_received(Bytes::from_static(b"he"));
        handler.on_stream(StreamedBody::new(Bytes::from_static(b"llo")));
        handler.complete();

        waiting.await.unwrap();
        assert_eq!(handler.status(), Some(200));
        assert_eq!(handler.body(), Bytes::from_static(b"hello"));
        assert_eq!(handler.terminal_count(), 1);
    }

    #[tokio::test]
    async fn failing_transport_counts_attempts() {
        let transport = FailingTransport::default();
        let uri: Uri = "http://example.com/".parse().unwrap();

        assert!(transport.connect(&uri).await.is_err());
        assert!(transport.connect(&uri).await.is_err());
        assert_eq!(transport.attempts(), 2);
    }
}
