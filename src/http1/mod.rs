//! HTTP/1.1 over hyper's client connection.
//!
//! The connection future runs on its own task; the [`Http1Codec`] keeps the
//! `SendRequest` half behind a mutex, as only one exchange can be in flight
//! on an HTTP/1.1 connection.

mod adapter;

pub use adapter::{AdapterState, H1Event, ResponseAdapter};

use crate::AsyncRuntime;
use crate::body::SinkBody;
use crate::connection::{ChannelId, Liveness};
use crate::error::TransportError;
use futures_lite::io::{AsyncRead, AsyncWrite};
use http::header::{HOST, HeaderValue};
use http::uri::{Parts, PathAndQuery};
use http::{Request, Response, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) type Http1Sender = Arc<Mutex<http1::SendRequest<SinkBody>>>;

pub(crate) type ResponseFuture =
    Pin<Box<dyn Future<Output = hyper::Result<Response<Incoming>>> + Send>>;

pub(crate) struct Http1Codec {
    sender: Http1Sender,
    liveness: Arc<Liveness>,
    shutdown: CancellationToken,
}

impl Http1Codec {
    pub(crate) fn sender(&self) -> Http1Sender {
        self.sender.clone()
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.liveness.is_closed() && !self.shutdown.is_cancelled()
    }

    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }
}

pub(crate) async fn handshake<I, R>(id: ChannelId, io: I, runtime: &R) -> anyhow::Result<Http1Codec>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRuntime,
{
    let (sender, connection) = http1::handshake(TokioIo::new(io.compat())).await?;

    let liveness = Arc::new(Liveness::default());
    let shutdown = CancellationToken::new();
    runtime.spawn({
        let liveness = liveness.clone();
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                result = connection => match result {
                    Ok(()) => trace!(connection = %id, "HTTP/1.1 connection finished"),
                    Err(error) => debug!(connection = %id, %error, "HTTP/1.1 connection failed"),
                },
                _ = shutdown.cancelled() => {
                    trace!(connection = %id, "HTTP/1.1 connection shut down")
                }
            }
            liveness.mark_closed();
        }
    });

    Ok(Http1Codec {
        sender: Arc::new(Mutex::new(sender)),
        liveness,
        shutdown,
    })
}

/// Rewrites the request for the wire: origin-form target, `Host` header.
pub(crate) fn prepare_request(mut request: Request<()>, body: SinkBody) -> Request<SinkBody> {
    if !request.headers().contains_key(HOST) {
        let host = request
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok());
        if let Some(host) = host {
            request.headers_mut().insert(HOST, host);
        }
    }

    let target = request
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let mut parts = Parts::default();
    parts.path_and_query = Some(target);
    if let Ok(uri) = Uri::from_parts(parts) {
        *request.uri_mut() = uri;
    }

    *request.version_mut() = Version::HTTP_11;
    request.map(|()| body)
}

/// Waits for the connection to be free and hands the request to hyper.
pub(crate) async fn send(
    sender: &Http1Sender,
    request: Request<SinkBody>,
) -> anyhow::Result<ResponseFuture> {
    let mut sender = sender.lock().await;
    sender.ready().await?;
    Ok(Box::pin(sender.send_request(request)))
}

/// Feeds the response of one exchange to the adapter, event by event.
pub(crate) async fn drive(
    response: ResponseFuture,
    adapter: &mut ResponseAdapter,
) -> anyhow::Result<()> {
    let response = match response.await {
        Ok(response) => response,
        Err(error) => return Err(adapter.exception_caught(classify(error))),
    };

    let (parts, mut body) = response.into_parts();
    adapter.on_event(H1Event::Headers(Response::from_parts(parts, ())))?;

    while adapter.state() == AdapterState::StreamingBody {
        match body.frame().await {
            None => adapter.on_event(H1Event::LastContent)?,
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    adapter.on_event(H1Event::Content(data))?;
                }
            }
            Some(Err(error)) => {
                let error = TransportError::Processing(error.into()).into();
                return Err(adapter.exception_caught(error));
            }
        }
    }
    Ok(())
}

/// Errors raised before any response arrived. Body errors are the
/// producer's doing; everything else is a failed exchange.
fn classify(error: hyper::Error) -> anyhow::Error {
    if error.is_user() || error.is_body_write_aborted() {
        TransportError::WriteFailed(error.into()).into()
    } else {
        TransportError::Processing(error.into()).into()
    }
}
