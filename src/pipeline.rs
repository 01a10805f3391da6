//! # Connection Pipeline
//!
//! Turns a freshly connected byte stream into a [`Connection`]:
//!
//! - picks the protocol from configuration and ALPN
//! - optionally wraps the stream so every read and write is traced
//! - performs the hyper HTTP/1.1 or `h2` handshake and spawns the driver
//!   task that owns the connection from then on
//!
//! TLS is already done at this point; the transport plugin performs it and
//! reports handshake failures through the normal connect error.
//!
//! Response handling is attached per request: HTTP/1.1 exchanges are driven
//! by a [`ResponseAdapter`](crate::http1::ResponseAdapter), HTTP/2
//! connections run a [`FrameListener`](crate::http2::FrameListener) inside
//! their driver task.

use crate::AsyncRuntime;
use crate::config::{ClientConfig, Protocol};
use crate::connection::{ChannelId, Codec, Connection};
use crate::http1;
use crate::http2;
use crate::transport::BidiStream;
use futures_lite::io::{AsyncRead, AsyncWrite};
use http::Version;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tracing::{debug, trace};

#[derive(Clone)]
pub struct PipelineInitializer<R> {
    runtime: R,
    protocol: Protocol,
    wire_logging: bool,
}

impl<R: AsyncRuntime> PipelineInitializer<R> {
    pub fn new(runtime: R, config: &ClientConfig) -> Self {
        Self {
            runtime,
            protocol: config.protocol(),
            wire_logging: config.wire_logging(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Installs the codec on a new connection.
    pub async fn channel_created<I: BidiStream>(&self, io: I) -> anyhow::Result<Connection> {
        let id = ChannelId::next();
        let alpn = io.alpn_protocol().map(<[u8]>::to_vec);
        let version = select_version(self.protocol, alpn.as_deref());
        debug!(
            connection = %id,
            ?version,
            alpn = ?alpn.as_deref().map(String::from_utf8_lossy),
            "initializing connection"
        );

        if self.wire_logging {
            self.install_codec(id, version, WireLogger::new(id, io)).await
        } else {
            self.install_codec(id, version, io).await
        }
    }

    /// Clears the request binding of a connection coming back to the pool.
    pub fn channel_released(&self, connection: &mut Connection) {
        if connection.unbind().is_some() {
            trace!(connection = %connection.id(), "request context unbound");
        }
    }

    async fn install_codec<I>(
        &self,
        id: ChannelId,
        version: Version,
        io: I,
    ) -> anyhow::Result<Connection>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let codec = if version == Version::HTTP_2 {
            Codec::Http2(http2::handshake(id, io, &self.runtime).await?)
        } else {
            Codec::Http1(http1::handshake(id, io, &self.runtime).await?)
        };
        Ok(Connection::new(id, codec))
    }
}

pub(crate) fn select_version(protocol: Protocol, alpn: Option<&[u8]>) -> Version {
    match (protocol, alpn) {
        (Protocol::Http2, _) => Version::HTTP_2,
        (Protocol::Http1, _) => Version::HTTP_11,
        (Protocol::Auto, Some(b"h2")) => Version::HTTP_2,
        (Protocol::Auto, _) => Version::HTTP_11,
    }
}

/// Traces the bytes crossing a connection.
pub struct WireLogger<I> {
    connection: ChannelId,
    inner: I,
}

impl<I> WireLogger<I> {
    pub fn new(connection: ChannelId, inner: I) -> Self {
        Self { connection, inner }
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for WireLogger<I> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let read = ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        trace!(
            connection = %self.connection,
            bytes = read,
            data = %String::from_utf8_lossy(&buf[..read]).escape_debug(),
            "READ"
        );
        Poll::Ready(Ok(read))
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for WireLogger<I> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let written = ready!(Pin::new(&mut self.inner).poll_write(cx, buf))?;
        trace!(
            connection = %self.connection,
            bytes = written,
            data = %String::from_utf8_lossy(&buf[..written]).escape_debug(),
            "WRITE"
        );
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        trace!(connection = %self.connection, "CLOSE");
        Pin::new(&mut self.inner).poll_close(cx)
    }
}
