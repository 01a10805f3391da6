//! Leasable channels.
//!
//! A [`Channel`] is what a pool hands out: either a whole physical
//! [`Connection`] (HTTP/1.1, or HTTP/2 on its way into the multiplexed pool)
//! or a [`StreamChannel`], one slot on a shared HTTP/2 connection.

use crate::context::RequestContext;
use crate::error::TransportError;
use crate::http1::{Http1Codec, Http1Sender};
use crate::http2::Http2Handle;
use http::Version;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Set by a connection's driver task once the connection is gone.
#[derive(Debug, Default)]
pub(crate) struct Liveness {
    closed: AtomicBool,
}

impl Liveness {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub(crate) enum Codec {
    Http1(Http1Codec),
    Http2(Http2Handle),
}

/// How a request is written on a leased channel.
pub(crate) enum RequestWriter {
    Http1(Http1Sender),
    Http2 {
        parent: Http2Handle,
        cancel: CancellationToken,
    },
}

/// A physical connection with its protocol codec installed.
pub struct Connection {
    id: ChannelId,
    codec: Codec,
    context: Option<Weak<RequestContext>>,
}

impl Connection {
    pub(crate) fn new(id: ChannelId, codec: Codec) -> Self {
        Self {
            id,
            codec,
            context: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn version(&self) -> Version {
        match self.codec {
            Codec::Http1(_) => Version::HTTP_11,
            Codec::Http2(_) => Version::HTTP_2,
        }
    }

    pub fn is_open(&self) -> bool {
        match &self.codec {
            Codec::Http1(codec) => codec.is_open(),
            Codec::Http2(handle) => handle.is_open(),
        }
    }

    /// Whether new HTTP/2 streams may be opened. Always `false` for HTTP/1.1.
    pub fn accepts_streams(&self) -> bool {
        match &self.codec {
            Codec::Http1(_) => false,
            Codec::Http2(handle) => handle.accepts_streams(),
        }
    }

    /// The peer's concurrent stream limit, for HTTP/2 connections.
    pub fn max_concurrent_streams(&self) -> Option<usize> {
        match &self.codec {
            Codec::Http1(_) => None,
            Codec::Http2(handle) => Some(handle.max_concurrent_streams()),
        }
    }

    pub fn close(&self) {
        match &self.codec {
            Codec::Http1(codec) => codec.close(),
            Codec::Http2(handle) => handle.close(),
        }
    }

    pub fn bound_context(&self) -> Option<Arc<RequestContext>> {
        self.context.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn bind(&mut self, context: &Arc<RequestContext>) {
        self.context = Some(Arc::downgrade(context));
    }

    pub(crate) fn unbind(&mut self) -> Option<Weak<RequestContext>> {
        self.context.take()
    }

    pub(crate) fn http2_handle(&self) -> Option<&Http2Handle> {
        match &self.codec {
            Codec::Http2(handle) => Some(handle),
            Codec::Http1(_) => None,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("version", &self.version())
            .field("open", &self.is_open())
            .finish()
    }
}

/// One HTTP/2 stream slot on a shared connection.
pub struct StreamChannel {
    id: ChannelId,
    parent: Http2Handle,
    cancel: CancellationToken,
    stream_id: Option<u32>,
    context: Option<Weak<RequestContext>>,
}

impl StreamChannel {
    pub(crate) fn new(parent: Http2Handle) -> Self {
        Self {
            id: ChannelId::next(),
            parent,
            cancel: CancellationToken::new(),
            stream_id: None,
            context: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn parent_id(&self) -> ChannelId {
        self.parent.id()
    }

    /// The wire stream id, once the request headers have been sent.
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub fn is_open(&self) -> bool {
        self.parent.is_open() && !self.cancel.is_cancelled()
    }

    /// Resets the stream if it is still running. The parent connection is
    /// unaffected.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("parent", &self.parent.id())
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// A leased unit of a pool.
#[derive(Debug)]
pub enum Channel {
    Connection(Connection),
    Stream(StreamChannel),
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        match self {
            Channel::Connection(connection) => connection.id(),
            Channel::Stream(stream) => stream.id(),
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Channel::Connection(connection) => connection.version(),
            Channel::Stream(_) => Version::HTTP_2,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Channel::Connection(connection) => connection.is_open(),
            Channel::Stream(stream) => stream.is_open(),
        }
    }

    pub fn close(&self) {
        match self {
            Channel::Connection(connection) => connection.close(),
            Channel::Stream(stream) => stream.close(),
        }
    }

    pub fn bound_context(&self) -> Option<Arc<RequestContext>> {
        match self {
            Channel::Connection(connection) => connection.bound_context(),
            Channel::Stream(stream) => stream.context.as_ref().and_then(Weak::upgrade),
        }
    }

    pub(crate) fn bind(&mut self, context: &Arc<RequestContext>) {
        match self {
            Channel::Connection(connection) => connection.bind(context),
            Channel::Stream(stream) => stream.context = Some(Arc::downgrade(context)),
        }
    }

    pub(crate) fn set_stream_id(&mut self, stream_id: u32) {
        if let Channel::Stream(stream) = self {
            stream.stream_id = Some(stream_id);
        }
    }

    pub(crate) fn writer(&self) -> anyhow::Result<RequestWriter> {
        match self {
            Channel::Connection(connection) => match &connection.codec {
                Codec::Http1(codec) => Ok(RequestWriter::Http1(codec.sender())),
                Codec::Http2(_) => Err(TransportError::Protocol(format!(
                    "connection {} speaks HTTP/2 and must be leased through the multiplexed pool",
                    connection.id
                ))
                .into()),
            },
            Channel::Stream(stream) => Ok(RequestWriter::Http2 {
                parent: stream.parent.clone(),
                cancel: stream.cancel.clone(),
            }),
        }
    }
}
