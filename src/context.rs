use crate::body::BodyProducer;
use crate::handler::{ResponseHandler, StreamedBody};
use crate::pool::ChannelPool;
use crate::response::ResponseHead;
use bytes::Bytes;
use http::Request;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything one in-flight request needs: the pool it leases from, the
/// wire request, the body producer and the response callbacks.
///
/// The context also guards delivery. Once `complete` or
/// `exception_occurred` has been delivered nothing else reaches the handler,
/// however many failure paths race to report.
pub struct RequestContext {
    pool: Arc<dyn ChannelPool>,
    request: Request<()>,
    producer: Mutex<Option<Box<dyn BodyProducer>>>,
    handler: Arc<dyn ResponseHandler>,
    terminated: AtomicBool,
}

impl RequestContext {
    pub fn new<P, H>(
        pool: Arc<dyn ChannelPool>,
        request: Request<()>,
        producer: P,
        handler: H,
    ) -> Arc<Self>
    where
        P: BodyProducer,
        H: ResponseHandler,
    {
        Arc::new(Self {
            pool,
            request,
            producer: Mutex::new(Some(Box::new(producer))),
            handler: Arc::new(handler),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn pool(&self) -> &Arc<dyn ChannelPool> {
        &self.pool
    }

    pub fn request(&self) -> &Request<()> {
        &self.request
    }

    pub fn handler(&self) -> &Arc<dyn ResponseHandler> {
        &self.handler
    }

    /// Whether a terminal callback has already been delivered.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// The producer can be subscribed only once.
    pub(crate) fn take_producer(&self) -> Option<Box<dyn BodyProducer>> {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// A fresh copy of the request line and headers for the codec.
    pub(crate) fn wire_request(&self) -> Request<()> {
        let mut request = Request::new(());
        *request.method_mut() = self.request.method().clone();
        *request.uri_mut() = self.request.uri().clone();
        *request.version_mut() = self.request.version();
        *request.headers_mut() = self.request.headers().clone();
        request
    }

    pub(crate) fn deliver_headers(&self, head: ResponseHead) {
        if !self.is_terminated() {
            self.handler.headers_received(head);
        }
    }

    pub(crate) fn deliver_body(&self, part: Bytes) {
        if !self.is_terminated() && !part.is_empty() {
            self.handler.body_part_received(part);
        }
    }

    pub(crate) fn deliver_stream(&self, body: StreamedBody) {
        if !self.is_terminated() {
            self.handler.on_stream(body);
        }
    }

    /// Delivers `complete`. Returns `false` if the request had already
    /// terminated.
    pub(crate) fn complete(&self) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handler.complete();
        true
    }

    /// Delivers `exception_occurred`. Returns `false` if the request had
    /// already terminated.
    pub(crate) fn fail(&self, error: anyhow::Error) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.handler.exception_occurred(error);
        true
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", self.request.method())
            .field("uri", self.request.uri())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}
