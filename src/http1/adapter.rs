use crate::context::RequestContext;
use crate::error::TransportError;
use crate::pool::Lease;
use crate::response::ResponseHead;
use bytes::Bytes;
use http::Response;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Inbound events of one HTTP/1.1 exchange.
#[derive(Debug)]
pub enum H1Event {
    Headers(Response<()>),
    Content(Bytes),
    LastContent,
}

impl fmt::Display for H1Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            H1Event::Headers(_) => f.write_str("response headers"),
            H1Event::Content(data) => write!(f, "{} bytes of content", data.len()),
            H1Event::LastContent => f.write_str("end of content"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    AwaitingHeaders,
    StreamingBody,
    Done,
}

/// Drives the response callbacks of one HTTP/1.1 lease and returns the
/// connection exactly once, on the last content or the first failure.
pub struct ResponseAdapter {
    context: Arc<RequestContext>,
    lease: Lease,
    state: AdapterState,
}

impl ResponseAdapter {
    pub fn new(context: Arc<RequestContext>, lease: Lease) -> Self {
        Self {
            context,
            lease,
            state: AdapterState::AwaitingHeaders,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn on_event(&mut self, event: H1Event) -> anyhow::Result<()> {
        match (self.state, event) {
            (AdapterState::AwaitingHeaders, H1Event::Headers(response)) => {
                self.state = AdapterState::StreamingBody;
                self.context
                    .deliver_headers(ResponseHead::from_response(&response));
            }
            (AdapterState::StreamingBody, H1Event::Content(data)) => {
                self.context.deliver_body(data);
            }
            (AdapterState::StreamingBody, H1Event::LastContent) => {
                self.state = AdapterState::Done;
                self.lease.release();
                self.context.complete();
            }
            (AdapterState::Done, event) => {
                trace!(
                    channel = %self.lease.channel_id(),
                    %event,
                    "ignoring event after the exchange ended"
                );
            }
            (state, event) => {
                let error = TransportError::Protocol(format!("unexpected {event} while {state:?}"));
                return Err(self.exception_caught(error.into()));
            }
        }
        Ok(())
    }

    /// Fails the request and returns the connection. The returned error is
    /// a summary for the connection pipeline's own diagnostics.
    pub fn exception_caught(&mut self, error: anyhow::Error) -> anyhow::Error {
        let summary = anyhow::anyhow!(
            "exchange on connection {} failed: {error:#}",
            self.lease.channel_id()
        );
        if self.state != AdapterState::Done {
            self.state = AdapterState::Done;
            debug!(
                channel = %self.lease.channel_id(),
                error = %format_args!("{error:#}"),
                "response processing failed"
            );
            self.context.fail(error);
            self.lease.close_and_release();
        }
        summary
    }
}
