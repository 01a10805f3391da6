//! Outbound request bodies.
//!
//! A [`BodyProducer`] is handed a [`BodySink`] once the request has a
//! connection. Whatever it writes is queued for the codec through a
//! [`SinkBody`], which implements [`http_body::Body`] so hyper and the HTTP/2
//! writer can pull from it at their own pace.

use crate::BoxError;
use crate::error::TransportError;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Supplies the bytes of a request body.
pub trait BodyProducer: Send + 'static {
    /// Starts producing into `sink`. The sink may be moved to another task
    /// and written to later; dropping it without completing fails the write.
    fn subscribe(self: Box<Self>, sink: BodySink);
}

impl BodyProducer for Bytes {
    fn subscribe(self: Box<Self>, mut sink: BodySink) {
        sink.write_and_complete(*self);
    }
}

impl BodyProducer for Vec<u8> {
    fn subscribe(self: Box<Self>, mut sink: BodySink) {
        sink.write_and_complete(Bytes::from(*self));
    }
}

impl BodyProducer for &'static str {
    fn subscribe(self: Box<Self>, mut sink: BodySink) {
        sink.write_and_complete(Bytes::from_static(self.as_bytes()));
    }
}

/// A body with no content.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBody;

impl BodyProducer for EmptyBody {
    fn subscribe(self: Box<Self>, mut sink: BodySink) {
        sink.complete();
    }
}

/// Adapts a closure into a [`BodyProducer`].
pub struct FnProducer<F>(F);

pub fn producer_fn<F>(f: F) -> FnProducer<F>
where
    F: FnOnce(BodySink) + Send + 'static,
{
    FnProducer(f)
}

impl<F> BodyProducer for FnProducer<F>
where
    F: FnOnce(BodySink) + Send + 'static,
{
    fn subscribe(self: Box<Self>, sink: BodySink) {
        (self.0)(sink)
    }
}

enum SinkMessage {
    Data(Bytes),
    Complete,
    Abort(BoxError),
}

type FailureCallback = Box<dyn Fn(anyhow::Error) + Send + Sync>;

struct FailureReporter {
    reported: AtomicBool,
    callback: FailureCallback,
}

impl FailureReporter {
    fn report(&self, error: anyhow::Error) {
        if !self.reported.swap(true, Ordering::AcqRel) {
            (self.callback)(error);
        }
    }
}

/// Creates a connected sink and body. `on_failure` runs at most once, the
/// first time the sink finds that the connection stopped reading.
pub fn channel<F>(on_failure: F) -> (BodySink, SinkBody)
where
    F: Fn(anyhow::Error) + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = BodySink {
        tx,
        finished: false,
        failure: Arc::new(FailureReporter {
            reported: AtomicBool::new(false),
            callback: Box::new(on_failure),
        }),
    };
    let body = SinkBody {
        rx,
        buffered: VecDeque::new(),
        done: false,
    };
    (sink, body)
}

/// The write side handed to a [`BodyProducer`].
pub struct BodySink {
    tx: mpsc::UnboundedSender<SinkMessage>,
    finished: bool,
    failure: Arc<FailureReporter>,
}

impl BodySink {
    /// Queues a chunk. Returns `false` if the body is already finished or
    /// the connection is no longer reading.
    pub fn write(&mut self, data: Bytes) -> bool {
        if data.is_empty() {
            return !self.finished;
        }
        self.send(SinkMessage::Data(data))
    }

    /// Queues the last chunk and ends the body.
    pub fn write_and_complete(&mut self, data: Bytes) -> bool {
        if !data.is_empty() && !self.send(SinkMessage::Data(data)) {
            return false;
        }
        self.complete()
    }

    pub fn complete(&mut self) -> bool {
        let sent = self.send(SinkMessage::Complete);
        self.finished = true;
        sent
    }

    /// Fails the request body. The codec stops sending and the request
    /// fails with a write error.
    pub fn abort(&mut self, error: impl Into<BoxError>) {
        let _ = self.send(SinkMessage::Abort(error.into()));
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn send(&mut self, message: SinkMessage) -> bool {
        if self.finished {
            trace!("ignoring write to a finished request body");
            return false;
        }
        if self.tx.send(message).is_err() {
            self.finished = true;
            debug!("request body write failed: connection stopped reading");
            self.failure.report(
                TransportError::WriteFailed("connection stopped reading the request body".into())
                    .into(),
            );
            return false;
        }
        true
    }
}

/// The read side of a [`BodySink`], consumed by the codec.
pub struct SinkBody {
    rx: mpsc::UnboundedReceiver<SinkMessage>,
    buffered: VecDeque<SinkMessage>,
    done: bool,
}

impl SinkBody {
    /// Pulls whatever the producer wrote synchronously during `subscribe`,
    /// so a body that is already complete reports an exact length.
    pub(crate) fn settle(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            let last = !matches!(message, SinkMessage::Data(_));
            self.buffered.push_back(message);
            if last {
                break;
            }
        }
    }

    fn settled_len(&self) -> Option<u64> {
        match self.buffered.back() {
            Some(SinkMessage::Complete) => Some(
                self.buffered
                    .iter()
                    .map(|message| match message {
                        SinkMessage::Data(data) => data.len() as u64,
                        _ => 0,
                    })
                    .sum(),
            ),
            _ => None,
        }
    }

    fn on_message(
        &mut self,
        message: Option<SinkMessage>,
    ) -> Option<Result<Frame<Bytes>, BoxError>> {
        match message {
            Some(SinkMessage::Data(data)) => Some(Ok(Frame::data(data))),
            Some(SinkMessage::Complete) => {
                self.done = true;
                None
            }
            Some(SinkMessage::Abort(error)) => {
                self.done = true;
                Some(Err(error))
            }
            None => {
                self.done = true;
                Some(Err("request body producer dropped the sink without completing".into()))
            }
        }
    }
}

impl Body for SinkBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.done {
            return Poll::Ready(None);
        }
        let message = match self.buffered.pop_front() {
            Some(message) => Some(message),
            None => ready!(self.rx.poll_recv(cx)),
        };
        Poll::Ready(self.on_message(message))
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.settled_len() == Some(0)
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            return SizeHint::with_exact(0);
        }
        match self.settled_len() {
            Some(len) => SizeHint::with_exact(len),
            None => SizeHint::default(),
        }
    }
}
