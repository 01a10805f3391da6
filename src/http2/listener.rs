use super::H2Frame;
use crate::connection::ChannelId;
use crate::context::RequestContext;
use crate::error::{GoAwayError, StreamReset, TransportError};
use crate::handler::StreamedBody;
use crate::pool::Lease;
use crate::response::ResponseHead;
use bytes::{Bytes, BytesMut};
use http::Response;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct StreamState {
    context: Arc<RequestContext>,
    lease: Lease,
    cumulated: BytesMut,
}

/// Demultiplexes the inbound events of one HTTP/2 connection onto the
/// requests bound to its streams.
///
/// Lives inside the connection's driver task. A stream is bound once its
/// request headers are on the wire and leaves the table on end of stream,
/// reset, `GOAWAY` refusal or connection failure, releasing its lease on
/// the way out.
pub struct FrameListener {
    connection: ChannelId,
    streams: HashMap<u32, StreamState>,
    going_away: bool,
}

impl FrameListener {
    pub fn new(connection: ChannelId) -> Self {
        Self {
            connection,
            streams: HashMap::new(),
            going_away: false,
        }
    }

    pub fn bind(&mut self, stream_id: u32, context: Arc<RequestContext>, lease: Lease) {
        let state = StreamState {
            context,
            lease,
            cumulated: BytesMut::new(),
        };
        if let Some(previous) = self.streams.insert(stream_id, state) {
            warn!(
                connection = %self.connection,
                stream_id,
                "stream bound twice; failing the previous request"
            );
            previous.context.fail(
                TransportError::Protocol(format!("stream {stream_id} was rebound")).into(),
            );
            previous.lease.release();
        }
    }

    pub fn is_bound(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_going_away(&self) -> bool {
        self.going_away
    }

    /// The peer sent a `GOAWAY` that refused none of the bound streams.
    pub fn peer_going_away(&mut self) {
        if !self.going_away {
            debug!(connection = %self.connection, "peer is going away; no new streams");
            self.going_away = true;
        }
    }

    /// Nothing left to finish after a `GOAWAY`.
    pub fn is_drained(&self) -> bool {
        self.going_away && self.streams.is_empty()
    }

    /// Handles one event and returns the number of body bytes consumed, to
    /// be handed back to the peer's flow-control window.
    pub fn on_frame(&mut self, frame: H2Frame) -> usize {
        match frame {
            H2Frame::Headers {
                stream_id,
                head,
                end_of_stream,
            } => {
                self.on_headers(stream_id, &head, end_of_stream);
                0
            }
            H2Frame::Data {
                stream_id,
                data,
                end_of_stream,
            } => self.on_data(stream_id, data, end_of_stream),
            H2Frame::RstStream {
                stream_id,
                error_code,
            } => {
                let reset = StreamReset::new(stream_id, error_code);
                debug!(connection = %self.connection, stream_id, %reset, "stream reset by peer");
                self.fail(stream_id, reset.into());
                0
            }
            H2Frame::GoAway {
                stream_id,
                error_code,
            } => {
                self.on_go_away(stream_id, error_code);
                0
            }
            H2Frame::StreamError { stream_id, error } => {
                debug!(
                    connection = %self.connection,
                    stream_id,
                    error = %format_args!("{error:#}"),
                    "stream failed"
                );
                self.fail(stream_id, error);
                0
            }
        }
    }

    /// The request gave up on the stream.
    pub fn on_cancelled(&mut self, stream_id: u32) {
        if self.streams.contains_key(&stream_id) {
            trace!(connection = %self.connection, stream_id, "stream cancelled");
            self.fail(stream_id, TransportError::Aborted.into());
        }
    }

    /// Fails every stream still open; the connection is gone.
    pub fn connection_closed(&mut self) {
        if !self.streams.is_empty() {
            debug!(
                connection = %self.connection,
                open = self.streams.len(),
                "connection closed with open streams"
            );
        }
        for (_, stream) in self.streams.drain() {
            stream.context.fail(TransportError::ConnectionClosed.into());
            stream.lease.release();
        }
    }

    fn on_headers(&mut self, stream_id: u32, head: &Response<()>, end_of_stream: bool) {
        let Some(stream) = self.streams.get(&stream_id) else {
            trace!(connection = %self.connection, stream_id, "headers for an unbound stream");
            return;
        };
        stream
            .context
            .deliver_headers(ResponseHead::from_response(head));
        if end_of_stream {
            self.finish(stream_id);
        }
    }

    fn on_data(&mut self, stream_id: u32, data: Bytes, end_of_stream: bool) -> usize {
        let consumed = data.len();
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            trace!(
                connection = %self.connection,
                stream_id,
                bytes = consumed,
                "data for an unbound stream"
            );
            return consumed;
        };
        stream.cumulated.extend_from_slice(&data);
        if end_of_stream {
            self.finish(stream_id);
        }
        consumed
    }

    fn on_go_away(&mut self, stream_id: u32, error_code: u32) {
        self.peer_going_away();
        self.fail(stream_id, GoAwayError::new(stream_id, error_code).into());
    }

    fn finish(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            trace!(
                connection = %self.connection,
                stream_id,
                bytes = stream.cumulated.len(),
                "stream complete"
            );
            stream
                .context
                .deliver_stream(StreamedBody::new(stream.cumulated.freeze()));
            stream.context.complete();
            stream.lease.release();
        }
    }

    fn fail(&mut self, stream_id: u32, error: anyhow::Error) {
        if let Some(stream) = self.streams.remove(&stream_id) {
            stream.context.fail(error);
            stream.lease.release();
        }
    }
}
