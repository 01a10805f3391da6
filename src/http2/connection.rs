//! The HTTP/2 connection driver.
//!
//! One task per connection polls the `h2` connection future and a command
//! queue. It owns the [`FrameListener`] and the per-stream flow-control
//! handles, so stream bookkeeping never leaves that task. Each request runs
//! on a stream task of its own, which opens the stream, pumps the request
//! body and forwards what `h2` surfaces for the stream back to the driver
//! as [`H2Frame`]s.

use super::frame::stream_failure;
use super::{FrameListener, H2Frame};
use crate::AsyncRuntime;
use crate::body::SinkBody;
use crate::connection::{ChannelId, Liveness};
use crate::context::RequestContext;
use crate::error::TransportError;
use crate::pool::Lease;
use bytes::Bytes;
use futures_lite::io::{AsyncRead, AsyncWrite};
use h2::client::{Connection as H2Connection, ResponseFuture, SendRequest};
use h2::{FlowControl, RecvStream, SendStream};
use http::header::{CONNECTION, HOST, HeaderName, TE, TRANSFER_ENCODING, UPGRADE};
use http::{Request, Version};
use http_body::Body;
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub(crate) enum Command {
    Open(OpenStream),
    Bind {
        stream_id: u32,
        context: Arc<RequestContext>,
        lease: Lease,
    },
    Track {
        stream_id: u32,
        flow: FlowControl,
    },
    Frame(H2Frame),
    Cancelled {
        stream_id: u32,
    },
    /// A stream task saw the peer's `GOAWAY` while opening a stream.
    GoingAway,
    /// A stream task ended; everything it forwarded is already queued.
    Finished,
    Close,
}

pub(crate) struct OpenStream {
    request: Request<()>,
    body: SinkBody,
    context: Arc<RequestContext>,
    lease: Lease,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<u32, OpenError>>,
}

/// Why a stream could not be opened.
pub(crate) enum OpenError {
    /// Nothing reached the wire: the connection is going away or already
    /// gone. The request body comes back unread, so the request can be
    /// sent on another connection.
    Refused { body: SinkBody, error: anyhow::Error },
    Failed(anyhow::Error),
}

impl OpenError {
    fn refused(body: SinkBody, error: impl Into<anyhow::Error>) -> Self {
        OpenError::Refused {
            body,
            error: error.into(),
        }
    }

    pub(crate) fn into_error(self) -> anyhow::Error {
        match self {
            OpenError::Refused { error, .. } | OpenError::Failed(error) => error,
        }
    }
}

#[derive(Debug)]
struct Shared {
    liveness: Liveness,
    going_away: AtomicBool,
    max_concurrent_streams: AtomicUsize,
}

/// A cloneable handle to a running HTTP/2 connection.
#[derive(Clone)]
pub(crate) struct Http2Handle {
    id: ChannelId,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Http2Handle {
    pub(crate) fn new(
        id: ChannelId,
        max_concurrent_streams: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, queue) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            liveness: Liveness::default(),
            going_away: AtomicBool::new(false),
            max_concurrent_streams: AtomicUsize::new(max_concurrent_streams),
        });
        (Self { id, commands, shared }, queue)
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.shared.liveness.is_closed()
    }

    /// Open and not going away.
    pub(crate) fn accepts_streams(&self) -> bool {
        self.is_open() && !self.shared.going_away.load(Ordering::Acquire)
    }

    pub(crate) fn max_concurrent_streams(&self) -> usize {
        self.shared.max_concurrent_streams.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.shared.liveness.mark_closed();
        let _ = self.commands.send(Command::Close);
    }

    /// Sends the request headers on a new stream and binds the request to
    /// it. Resolves to the wire stream id.
    pub(crate) async fn open_stream(
        &self,
        request: Request<()>,
        body: SinkBody,
        context: Arc<RequestContext>,
        lease: Lease,
        cancel: CancellationToken,
    ) -> Result<u32, OpenError> {
        let (reply, opened) = oneshot::channel();
        let open = OpenStream {
            request,
            body,
            context,
            lease,
            cancel,
            reply,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Open(open)) {
            return Err(match command {
                Command::Open(open) => {
                    OpenError::refused(open.body, TransportError::ConnectionClosed)
                }
                _ => OpenError::Failed(TransportError::ConnectionClosed.into()),
            });
        }
        opened
            .await
            .unwrap_or_else(|_| Err(OpenError::Failed(TransportError::ConnectionClosed.into())))
    }

    #[cfg(test)]
    pub(crate) fn set_going_away(&self) {
        self.shared.going_away.store(true, Ordering::Release);
    }
}

/// Removes the headers HTTP/2 forbids and marks the request as HTTP/2.
pub(crate) fn prepare_request(mut request: Request<()>) -> Request<()> {
    let headers = request.headers_mut();
    headers.remove(HOST);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
    headers.remove(HeaderName::from_static("keep-alive"));
    headers.remove(HeaderName::from_static("proxy-connection"));
    if headers.get(TE).is_some_and(|te| te != "trailers") {
        headers.remove(TE);
    }
    for name in connection_listed(headers) {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    *request.version_mut() = Version::HTTP_2;
    request
}

fn connection_listed(headers: &http::HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

pub(crate) async fn handshake<I, R>(
    id: ChannelId,
    io: I,
    runtime: &R,
) -> anyhow::Result<Http2Handle>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRuntime,
{
    let mut builder = h2::client::Builder::new();
    builder.enable_push(false);
    let (sender, connection) = builder.handshake::<_, Bytes>(io.compat()).await?;

    let (handle, queue) = Http2Handle::new(id, sender.current_max_send_streams());
    let driver = Driver {
        id,
        sender,
        commands: handle.commands.downgrade(),
        shared: handle.shared.clone(),
        listener: FrameListener::new(id),
        flows: HashMap::new(),
        tasks: 0,
        runtime: runtime.clone(),
    };
    runtime.spawn(driver.run(connection, queue));
    Ok(handle)
}

/// How long stream tasks get to forward what they already received once
/// the peer closed the connection.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Driver<R> {
    id: ChannelId,
    sender: SendRequest<Bytes>,
    commands: mpsc::WeakUnboundedSender<Command>,
    shared: Arc<Shared>,
    listener: FrameListener,
    flows: HashMap<u32, FlowControl>,
    /// Stream tasks that have not reported [`Command::Finished`] yet.
    tasks: usize,
    runtime: R,
}

impl<R: AsyncRuntime> Driver<R> {
    async fn run<I>(
        mut self,
        connection: H2Connection<Compat<I>, Bytes>,
        mut queue: mpsc::UnboundedReceiver<Command>,
    ) where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut connection = std::pin::pin!(connection);
        let closed_by_peer = loop {
            tokio::select! {
                biased;
                command = queue.recv() => match command {
                    Some(Command::Close) | None => {
                        trace!(connection = %self.id, "closing HTTP/2 connection");
                        break false;
                    }
                    Some(command) => self.on_command(command),
                },
                result = &mut connection => {
                    match result {
                        Ok(()) => {
                            debug!(connection = %self.id, "HTTP/2 connection closed by peer")
                        }
                        Err(error) => {
                            warn!(connection = %self.id, %error, "HTTP/2 connection failed")
                        }
                    }
                    break true;
                }
            }

            self.shared
                .max_concurrent_streams
                .store(self.sender.current_max_send_streams(), Ordering::Release);
            if self.listener.is_going_away() {
                self.shared.going_away.store(true, Ordering::Release);
                if self.listener.is_drained() && self.tasks == 0 {
                    debug!(connection = %self.id, "all streams finished after GOAWAY");
                    break false;
                }
            }
        };

        self.shared.liveness.mark_closed();
        if closed_by_peer {
            self.drain(&mut queue).await;
        }
        self.listener.connection_closed();
    }

    /// Delivers what the stream tasks still forward after the connection
    /// ended, so responses that arrived before the close complete normally.
    async fn drain(&mut self, queue: &mut mpsc::UnboundedReceiver<Command>) {
        let deadline = self.runtime.sleep(DRAIN_TIMEOUT);
        let mut deadline = std::pin::pin!(deadline);
        while self.tasks > 0 {
            tokio::select! {
                biased;
                command = queue.recv() => match command {
                    Some(Command::Close) | None => return,
                    Some(command) => self.on_command(command),
                },
                _ = &mut deadline => {
                    debug!(
                        connection = %self.id,
                        tasks = self.tasks,
                        "stream tasks did not finish in time"
                    );
                    return;
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open(open) => self.open_stream(open),
            Command::Bind {
                stream_id,
                context,
                lease,
            } => self.listener.bind(stream_id, context, lease),
            Command::Track { stream_id, flow } => {
                if self.listener.is_bound(stream_id) {
                    self.flows.insert(stream_id, flow);
                }
            }
            Command::Frame(frame) => {
                let stream_id = frame.stream_id();
                let consumed = self.listener.on_frame(frame);
                if consumed > 0 {
                    self.release_capacity(stream_id, consumed);
                }
                if !self.listener.is_bound(stream_id) {
                    self.flows.remove(&stream_id);
                }
            }
            Command::Cancelled { stream_id } => {
                self.listener.on_cancelled(stream_id);
                self.flows.remove(&stream_id);
            }
            Command::GoingAway => self.listener.peer_going_away(),
            Command::Finished => self.tasks = self.tasks.saturating_sub(1),
            Command::Close => {}
        }
    }

    fn release_capacity(&mut self, stream_id: u32, consumed: usize) {
        let Some(flow) = self.flows.get_mut(&stream_id) else {
            return;
        };
        if let Err(error) = flow.release_capacity(consumed) {
            trace!(
                connection = %self.id,
                stream_id,
                %error,
                "could not release flow-control capacity"
            );
        }
    }

    fn open_stream(&mut self, open: OpenStream) {
        if self.listener.is_going_away() || self.shared.liveness.is_closed() {
            trace!(connection = %self.id, "refusing a stream on a closing connection");
            let _ = open
                .reply
                .send(Err(OpenError::refused(open.body, TransportError::ConnectionClosed)));
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            let _ = open
                .reply
                .send(Err(OpenError::refused(open.body, TransportError::ConnectionClosed)));
            return;
        };
        self.tasks += 1;
        let task = StreamTask {
            connection: self.id,
            shared: self.shared.clone(),
            commands,
        };
        self.runtime.spawn(task.run(self.sender.clone(), open));
    }
}

/// Runs one request stream from headers to the end of the response.
struct StreamTask {
    connection: ChannelId,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Finished);
    }
}

impl StreamTask {
    async fn run(self, sender: SendRequest<Bytes>, open: OpenStream) {
        let OpenStream {
            request,
            body,
            context,
            lease,
            cancel,
            reply,
        } = open;
        let connection = self.connection;
        let commands = &self.commands;

        let started = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = reply.send(Err(OpenError::Failed(TransportError::Aborted.into())));
                return;
            }
            started = start_stream(sender, request, body.is_end_stream()) => started,
        };
        let (response, send) = match started {
            Ok(started) => started,
            Err(error) if error.is_go_away() => {
                debug!(%connection, %error, "connection is going away; stream refused");
                self.shared.going_away.store(true, Ordering::Release);
                let _ = commands.send(Command::GoingAway);
                let _ = reply.send(Err(OpenError::refused(body, write_failed(error))));
                return;
            }
            Err(error) => {
                let _ = reply.send(Err(OpenError::Failed(write_failed(error))));
                return;
            }
        };

        let stream_id = response.stream_id().as_u32();
        trace!(%connection, stream_id, "stream opened");
        if commands
            .send(Command::Bind {
                stream_id,
                context,
                lease,
            })
            .is_err()
        {
            let _ = reply.send(Err(OpenError::Failed(TransportError::ConnectionClosed.into())));
            return;
        }
        let _ = reply.send(Ok(stream_id));

        // The stream is done once the response is; an unfinished upload is
        // dropped with it, which resets the stream.
        let upload = async {
            if let Some(send) = send {
                if let Err(error) = pump_body(body, send).await {
                    let failure = H2Frame::StreamError { stream_id, error };
                    let _ = commands.send(Command::Frame(failure));
                }
            }
            std::future::pending::<()>().await
        };
        let download = read_response(stream_id, response, commands);

        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping the stream handles resets the stream with CANCEL.
                let _ = commands.send(Command::Cancelled { stream_id });
            }
            _ = download => {}
            _ = upload => {}
        }
    }
}

async fn start_stream(
    sender: SendRequest<Bytes>,
    request: Request<()>,
    end_of_stream: bool,
) -> Result<(ResponseFuture, Option<SendStream<Bytes>>), h2::Error> {
    let mut sender = sender.ready().await?;
    let (response, send) = sender.send_request(request, end_of_stream)?;
    Ok((response, (!end_of_stream).then_some(send)))
}

fn write_failed(error: h2::Error) -> anyhow::Error {
    TransportError::WriteFailed(error.into()).into()
}

/// Copies the request body onto the stream, waiting for send capacity
/// before each chunk.
async fn pump_body(mut body: SinkBody, mut send: SendStream<Bytes>) -> anyhow::Result<()> {
    loop {
        send.reserve_capacity(1);
        if send.capacity() == 0 {
            loop {
                match poll_fn(|cx| send.poll_capacity(cx)).await {
                    Some(Ok(0)) => continue,
                    Some(Ok(_)) => break,
                    Some(Err(error)) => return Err(write_failed(error)),
                    None => {
                        return Err(TransportError::WriteFailed(
                            "stream closed while sending the request body".into(),
                        )
                        .into());
                    }
                }
            }
        }

        let frame = match body.frame().await {
            None => {
                send.send_data(Bytes::new(), true).map_err(write_failed)?;
                return Ok(());
            }
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                send.send_reset(h2::Reason::CANCEL);
                return Err(TransportError::WriteFailed(error).into());
            }
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        let end_of_stream = body.is_end_stream();
        send.send_data(data, end_of_stream).map_err(write_failed)?;
        if end_of_stream {
            return Ok(());
        }
    }
}

/// Forwards the response of one stream to the driver.
async fn read_response(
    stream_id: u32,
    response: ResponseFuture,
    commands: &mpsc::UnboundedSender<Command>,
) {
    let forward = |frame| {
        let _ = commands.send(Command::Frame(frame));
    };

    let response = match response.await {
        Ok(response) => response,
        Err(error) => return forward(stream_failure(stream_id, error)),
    };
    let (parts, mut recv): (_, RecvStream) = response.into_parts();
    let end_of_stream = recv.is_end_stream();
    let _ = commands.send(Command::Track {
        stream_id,
        flow: recv.flow_control().clone(),
    });
    forward(H2Frame::Headers {
        stream_id,
        head: http::Response::from_parts(parts, ()),
        end_of_stream,
    });
    if end_of_stream {
        return;
    }

    loop {
        match recv.data().await {
            Some(Ok(data)) => {
                let end_of_stream = recv.is_end_stream();
                forward(H2Frame::Data {
                    stream_id,
                    data,
                    end_of_stream,
                });
                if end_of_stream {
                    return;
                }
            }
            Some(Err(error)) => return forward(stream_failure(stream_id, error)),
            None => {
                return forward(H2Frame::Data {
                    stream_id,
                    data: Bytes::new(),
                    end_of_stream: true,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_specific_headers_are_stripped() {
        let request = Request::get("https://example.com/")
            .header(HOST, "example.com")
            .header(CONNECTION, "keep-alive, x-hop")
            .header("x-hop", "1")
            .header("keep-alive", "timeout=5")
            .header(TE, "gzip")
            .header("x-kept", "yes")
            .body(())
            .unwrap();

        let request = prepare_request(request);

        assert_eq!(request.version(), Version::HTTP_2);
        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.headers()["x-kept"], "yes");
    }

    #[test]
    fn te_trailers_is_allowed() {
        let request = Request::get("https://example.com/")
            .header(TE, "trailers")
            .body(())
            .unwrap();
        assert_eq!(prepare_request(request).headers()[TE], "trailers");
    }

    #[tokio::test]
    async fn detached_handle_reports_closed_after_close() {
        let (handle, mut queue) = Http2Handle::new(ChannelId::next(), 7);
        assert!(handle.accepts_streams());
        assert_eq!(handle.max_concurrent_streams(), 7);

        handle.close();

        assert!(!handle.is_open());
        assert!(!handle.accepts_streams());
        assert!(matches!(queue.recv().await, Some(Command::Close)));
    }
}
