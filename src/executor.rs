use crate::AsyncRuntime;
use crate::body;
use crate::connection::{Channel, RequestWriter};
use crate::context::RequestContext;
use crate::error::{GoAwayError, StreamReset, TransportError};
use crate::http1::{self, ResponseAdapter};
use crate::http2::{self, OpenError};
use crate::pool::{ChannelPool, Lease};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{Instrument, debug, debug_span, trace, warn};

/// How often a request refused by a closing HTTP/2 connection is moved to
/// another connection before the refusal is reported.
const MAX_REFUSED_RETRIES: usize = 2;

/// Runs one request: leases a channel, writes the request and leaves the
/// response to the protocol layer bound to the channel.
///
/// Every path ends in exactly one of `complete` or `exception_occurred` on
/// the handler, and a leased channel goes back to its pool exactly once.
pub struct RequestExecutor<R> {
    context: Arc<RequestContext>,
    runtime: R,
    lease: Arc<LeaseSlot>,
    started: AtomicBool,
}

/// The lease currently held by a request. A refused HTTP/2 stream swaps it
/// for a lease on another connection.
#[derive(Default)]
struct LeaseSlot(Mutex<Option<Lease>>);

impl LeaseSlot {
    fn set(&self, lease: Lease) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(lease);
    }

    fn get(&self) -> Option<Lease> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<R: AsyncRuntime> RequestExecutor<R> {
    pub fn new(context: Arc<RequestContext>, runtime: R) -> Self {
        Self {
            context,
            runtime,
            lease: Arc::new(LeaseSlot::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    /// Starts the request in the background. Only the first call does
    /// anything.
    pub fn run(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("request executor started twice; ignoring");
            return;
        }
        let request = self.context.request();
        let span = debug_span!("request", method = %request.method(), uri = %request.uri());
        let context = self.context.clone();
        let slot = self.lease.clone();
        self.runtime.spawn(execute(context, slot).instrument(span));
    }

    /// Closes and releases the leased channel. Does nothing before a
    /// channel is leased or after the request finished.
    pub fn abort(&self) {
        let Some(lease) = self.lease.get() else {
            trace!("abort before a channel was leased; nothing to do");
            return;
        };
        if lease.is_released() {
            trace!("abort after the channel was released; nothing to do");
            return;
        }
        debug!(channel = %lease.channel_id(), "aborting request");
        self.context.fail(TransportError::Aborted.into());
        lease.close_and_release();
    }
}

impl<R> fmt::Debug for RequestExecutor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("context", &self.context)
            .field("lease", &self.lease.get())
            .finish_non_exhaustive()
    }
}

async fn execute(context: Arc<RequestContext>, slot: Arc<LeaseSlot>) {
    let pool = context.pool().clone();
    let Some(mut lease) = lease_channel(&context, &pool, &slot).await else {
        return;
    };

    let mut body = {
        let failed_context = context.clone();
        let failed_slot = slot.clone();
        let (mut sink, mut body) = body::channel(move |error| {
            debug!(error = %format_args!("{error:#}"), "request body could not be written");
            failed_context.fail(error);
            if let Some(lease) = failed_slot.get() {
                lease.close_and_release();
            }
        });
        match context.take_producer() {
            Some(producer) => producer.subscribe(sink),
            None => {
                sink.complete();
            }
        }
        body.settle();
        body
    };

    let mut refused = 0;
    loop {
        let writer = match lease.with_channel(|channel: &mut Channel| channel.writer()) {
            Some(Ok(writer)) => writer,
            Some(Err(error)) => return write_failed(&context, &lease, error),
            None => {
                trace!("channel released before the request was written");
                context.fail(TransportError::Aborted.into());
                return;
            }
        };

        match writer {
            RequestWriter::Http1(sender) => {
                let request = http1::prepare_request(context.wire_request(), body);
                let response = match http1::send(&sender, request).await {
                    Ok(response) => response,
                    Err(error) => return write_failed(&context, &lease, error),
                };
                let mut adapter = ResponseAdapter::new(context.clone(), lease);
                if let Err(error) = http1::drive(response, &mut adapter).await {
                    trace!(error = %format_args!("{error:#}"), "exchange ended with an error");
                }
                return;
            }
            RequestWriter::Http2 { parent, cancel } => {
                let request = http2::prepare_request(context.wire_request());
                match parent
                    .open_stream(request, body, context.clone(), lease.clone(), cancel)
                    .await
                {
                    Ok(stream_id) => {
                        lease.with_channel(|channel| channel.set_stream_id(stream_id));
                        trace!(stream_id, "request headers written");
                        return;
                    }
                    Err(OpenError::Refused { body: unsent, error })
                        if refused < MAX_REFUSED_RETRIES && !context.is_terminated() =>
                    {
                        refused += 1;
                        debug!(
                            channel = %lease.channel_id(),
                            error = %format_args!("{error:#}"),
                            "stream refused; moving the request to another connection"
                        );
                        body = unsent;
                        lease.release();
                        lease = match lease_channel(&context, &pool, &slot).await {
                            Some(lease) => lease,
                            None => return,
                        };
                    }
                    Err(error) => return write_failed(&context, &lease, error.into_error()),
                }
            }
        }
    }
}

/// Acquires a channel and binds the request to it. Reports the failure
/// itself when there is none.
async fn lease_channel(
    context: &Arc<RequestContext>,
    pool: &Arc<dyn ChannelPool>,
    slot: &LeaseSlot,
) -> Option<Lease> {
    let mut channel = match pool.acquire().await {
        Ok(channel) => channel,
        Err(error) => {
            debug!(error = %format_args!("{error:#}"), "failed to acquire a channel");
            context.fail(typed_or(error, TransportError::AcquireFailed));
            return None;
        }
    };
    trace!(channel = %channel.id(), "channel acquired");

    channel.bind(context);
    let lease = Lease::new(pool.clone(), channel);
    slot.set(lease.clone());
    Some(lease)
}

fn write_failed(context: &RequestContext, lease: &Lease, error: anyhow::Error) {
    debug!(error = %format_args!("{error:#}"), "failed to write the request");
    context.fail(typed_or(error, TransportError::WriteFailed));
    lease.close_and_release();
}

/// Keeps errors that already say what went wrong; wraps everything else.
fn typed_or(
    error: anyhow::Error,
    wrap: fn(crate::BoxError) -> TransportError,
) -> anyhow::Error {
    if error.is::<TransportError>() || error.is::<StreamReset>() || error.is::<GoAwayError>() {
        error
    } else {
        wrap(error.into()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmptyBody;
    use crate::testing::{Recorder, StubPool, TestRuntime};
    use http::Request;

    fn executor(pool: Arc<StubPool>, recorder: &Recorder) -> RequestExecutor<TestRuntime> {
        let request = Request::get("http://example.com/").body(()).unwrap();
        let context = RequestContext::new(pool, request, EmptyBody, recorder.clone());
        RequestExecutor::new(context, TestRuntime)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn acquire_failure_is_reported_without_a_release() {
        let pool = StubPool::failing();
        let recorder = Recorder::default();
        let executor = executor(pool.clone(), &recorder);

        executor.run();
        settle().await;

        assert_eq!(recorder.terminal_count(), 1);
        assert!(recorder.error_is(|error: &TransportError| {
            matches!(error, TransportError::AcquireFailed(_))
        }));
        assert_eq!(pool.released(), 0);
    }

    #[tokio::test]
    async fn refused_stream_moves_to_another_channel_then_fails_once() {
        // The stub's HTTP/2 connections have no driver behind them, so every
        // stream is refused.
        let pool = StubPool::streams(1);
        let recorder = Recorder::default();
        let executor = executor(pool.clone(), &recorder);

        executor.run();
        settle().await;

        assert_eq!(recorder.terminal_count(), 1);
        assert!(recorder.error_is(|error: &TransportError| {
            matches!(error, TransportError::ConnectionClosed)
        }));
        assert_eq!(pool.acquired(), 1 + MAX_REFUSED_RETRIES);
        assert_eq!(pool.released(), pool.acquired());
        assert_eq!(pool.released_open(), MAX_REFUSED_RETRIES);

        executor.abort();
        assert_eq!(recorder.terminal_count(), 1);
        assert_eq!(pool.released(), 1 + MAX_REFUSED_RETRIES);
    }

    #[tokio::test]
    async fn abort_before_run_is_a_no_op() {
        let pool = StubPool::streams(1);
        let recorder = Recorder::default();
        let executor = executor(pool.clone(), &recorder);

        executor.abort();

        assert!(recorder.events().is_empty());
        assert_eq!(pool.acquired(), 0);
    }

    #[tokio::test]
    async fn second_run_is_ignored() {
        let pool = StubPool::failing();
        let recorder = Recorder::default();
        let executor = executor(pool.clone(), &recorder);

        executor.run();
        executor.run();
        settle().await;

        assert_eq!(pool.acquired(), 1);
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn typed_errors_are_not_rewrapped() {
        let reset = typed_or(StreamReset::new(1, 8).into(), TransportError::WriteFailed);
        assert!(reset.is::<StreamReset>());

        let other = typed_or(anyhow::anyhow!("broken pipe"), TransportError::WriteFailed);
        assert!(matches!(
            other.downcast_ref::<TransportError>(),
            Some(TransportError::WriteFailed(_))
        ));
    }
}
