//! Test doubles shared by the unit tests.

use crate::AsyncRuntime;
use crate::connection::{Channel, ChannelId, Codec, Connection, StreamChannel};
use crate::error::TransportError;
use crate::handler::{ResponseHandler, StreamedBody};
use crate::http2::Http2Handle;
use crate::pool::ChannelPool;
use crate::response::ResponseHead;
use bytes::Bytes;
use futures_lite::future::Boxed;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TestRuntime;

impl AsyncRuntime for TestRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Headers(u16),
    Body(Bytes),
    Stream(Bytes),
    Error(String),
    Complete,
}

#[derive(Default)]
struct Recorded {
    events: Vec<Event>,
    heads: Vec<ResponseHead>,
    errors: Vec<anyhow::Error>,
}

/// Records every callback it receives.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    inner: Arc<Mutex<Recorded>>,
}

impl Recorder {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().events.clone()
    }

    pub(crate) fn terminal_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Error(_) | Event::Complete))
            .count()
    }

    pub(crate) fn last_head(&self) -> Option<ResponseHead> {
        self.inner.lock().unwrap().heads.last().cloned()
    }

    pub(crate) fn error<T>(&self) -> Option<T>
    where
        T: std::error::Error + Clone + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .errors
            .iter()
            .find_map(|error| error.downcast_ref::<T>().cloned())
    }

    pub(crate) fn error_is<T>(&self, predicate: impl Fn(&T) -> bool) -> bool
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .unwrap()
            .errors
            .iter()
            .any(|error| error.downcast_ref::<T>().is_some_and(&predicate))
    }

    fn push(&self, event: Event) {
        self.inner.lock().unwrap().events.push(event);
    }
}

impl ResponseHandler for Recorder {
    fn headers_received(&self, response: ResponseHead) {
        let mut recorded = self.inner.lock().unwrap();
        recorded.events.push(Event::Headers(response.status_code()));
        recorded.heads.push(response);
    }

    fn body_part_received(&self, part: Bytes) {
        self.push(Event::Body(part));
    }

    fn on_stream(&self, body: StreamedBody) {
        self.push(Event::Stream(body.into_bytes()));
    }

    fn exception_occurred(&self, error: anyhow::Error) {
        let mut recorded = self.inner.lock().unwrap();
        recorded.events.push(Event::Error(error.to_string()));
        recorded.errors.push(error);
    }

    fn complete(&self) {
        self.push(Event::Complete);
    }
}

enum Mode {
    /// Stream channels over one detached connection handle.
    Streams(Http2Handle),
    /// A fresh HTTP/2 connection per acquire.
    Connections { peer_max_streams: usize },
    Failing,
}

/// Pool double that counts acquires and releases.
///
/// Nothing behind its channels drives a socket; the HTTP/2 handles only
/// carry liveness and peer settings.
pub(crate) struct StubPool {
    mode: Mode,
    acquired: AtomicUsize,
    released: AtomicUsize,
    released_open: AtomicUsize,
    closed: AtomicBool,
    handles: Mutex<Vec<Http2Handle>>,
}

impl StubPool {
    fn with_mode(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            released_open: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn streams(max_concurrent_streams: usize) -> Arc<Self> {
        let (handle, _) = Http2Handle::new(ChannelId::next(), max_concurrent_streams);
        Self::with_mode(Mode::Streams(handle))
    }

    pub(crate) fn h2_connections(peer_max_streams: usize) -> Arc<Self> {
        Self::with_mode(Mode::Connections { peer_max_streams })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Self::with_mode(Mode::Failing)
    }

    pub(crate) fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Channels that were still open when released.
    pub(crate) fn released_open(&self) -> usize {
        self.released_open.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles of the connections created so far, oldest first.
    pub(crate) fn handles(&self) -> Vec<Http2Handle> {
        self.handles.lock().unwrap().clone()
    }

    fn next_channel(&self) -> anyhow::Result<Channel> {
        match &self.mode {
            Mode::Streams(handle) => Ok(Channel::Stream(StreamChannel::new(handle.clone()))),
            Mode::Connections { peer_max_streams } => {
                let id = ChannelId::next();
                let (handle, _) = Http2Handle::new(id, *peer_max_streams);
                self.handles.lock().unwrap().push(handle.clone());
                Ok(Channel::Connection(Connection::new(id, Codec::Http2(handle))))
            }
            Mode::Failing => Err(TransportError::AcquireFailed("connection refused".into()).into()),
        }
    }
}

impl ChannelPool for StubPool {
    fn acquire(&self) -> Boxed<anyhow::Result<Channel>> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let channel = if self.is_closed() {
            Err(TransportError::PoolClosed.into())
        } else {
            self.next_channel()
        };
        Box::pin(async move { channel })
    }

    fn release(&self, channel: Channel) -> Boxed<anyhow::Result<()>> {
        self.released.fetch_add(1, Ordering::SeqCst);
        if channel.is_open() {
            self.released_open.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(async { Ok(()) })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
