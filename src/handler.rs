use crate::response::ResponseHead;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Callbacks through which a response is delivered.
///
/// For a single request the calls arrive in wire order:
/// `headers_received` first, then body callbacks, then exactly one of
/// `complete` or `exception_occurred`. After an [`abort`](crate::RequestExecutor::abort)
/// a callback that was already in flight may still arrive.
pub trait ResponseHandler: Send + Sync + 'static {
    fn headers_received(&self, response: ResponseHead);

    /// A chunk of the body, delivered as it arrives (HTTP/1.1).
    fn body_part_received(&self, part: Bytes);

    /// The whole body at once (HTTP/2).
    ///
    /// The default forwards the bytes to [`body_part_received`](Self::body_part_received).
    fn on_stream(&self, body: StreamedBody) {
        let bytes = body.into_bytes();
        if !bytes.is_empty() {
            self.body_part_received(bytes);
        }
    }

    fn exception_occurred(&self, error: anyhow::Error);

    fn complete(&self);
}

/// A fully accumulated response body.
///
/// Implements [`Body`] yielding a single data frame, so it can be fed to
/// anything that consumes `http_body` bodies.
#[derive(Debug, Default)]
pub struct StreamedBody {
    data: Option<Bytes>,
}

impl StreamedBody {
    pub fn new(data: Bytes) -> Self {
        Self { data: Some(data) }
    }

    pub fn into_bytes(self) -> Bytes {
        self.data.unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Body for StreamedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(
            self.data
                .take()
                .filter(|data| !data.is_empty())
                .map(|data| Ok(Frame::data(data))),
        )
    }

    fn is_end_stream(&self) -> bool {
        self.is_empty()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.len() as u64)
    }
}
