//! # Transport Abstraction Traits
//!
//! The pools never open sockets themselves. Every physical connection comes
//! from a [`TransportPlugin`], which resolves the destination, performs any
//! TLS handshake and hands back a plain bidirectional byte stream. The HTTP
//! codec is layered on top of that stream by the
//! [`PipelineInitializer`](crate::pipeline::PipelineInitializer).

use futures_lite::io::{AsyncRead, AsyncWrite};
use http::Uri;
use std::future::Future;

/// A bidirectional byte stream to a remote peer.
///
/// All streams are required to be:
///
/// - [`Unpin`] to simplify async usage
/// - [`Send`] so the codec driver can own them on a background task
/// - `'static` so they can be owned by long-lived async tasks
pub trait BidiStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns the negotiated ALPN protocol for this stream, if available.
    ///
    /// This is meaningful for transports layered over TLS. A stream
    /// reporting `h2` is spoken to with the HTTP/2 codec when the client is
    /// configured for [`Protocol::Auto`](crate::Protocol::Auto).
    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }
}

/// A transport plugin capable of establishing connections.
///
/// This trait serves as the entry point for a transport implementation.
/// Pools use a `TransportPlugin` to create connections without depending on
/// a concrete transport backend.
pub trait TransportPlugin: Send + Sync + 'static {
    /// Stream type produced by this transport.
    type Io: BidiStream;

    /// Establishes a connection to the given URI.
    ///
    /// Only the scheme and authority are meaningful; the path is ignored.
    fn connect(&self, uri: &Uri) -> impl Future<Output = anyhow::Result<Self::Io>> + Send;
}
