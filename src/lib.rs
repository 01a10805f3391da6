#![doc = include_str!("../README.md")]

pub use anyhow;
pub use bytes;
pub use http;
pub use http_body;

use std::future::Future;
use std::time::Duration;

pub mod body;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
mod event_loop;
pub mod executor;
pub mod handler;
pub mod http1;
pub mod http2;
pub mod pipeline;
pub mod pool;
pub mod response;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use body::{BodyProducer, BodySink, EmptyBody, producer_fn};
pub use client::AsyncHttpClient;
pub use config::{ClientConfig, Protocol};
pub use connection::{Channel, ChannelId};
pub use context::RequestContext;
pub use error::{GoAwayError, StreamReset, TransportError};
pub use executor::RequestExecutor;
pub use handler::{ResponseHandler, StreamedBody};
pub use pool::{ChannelPool, Lease};
pub use response::ResponseHead;
pub use transport::{BidiStream, TransportPlugin};

/// A standard boxed error type used throughout the client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Defines the runtime capabilities required by the client.
///
/// Pools and connections run as spawned tasks, and the bounded pool needs
/// a timer to expire waiters, so a runtime must provide both.
pub trait AsyncRuntime: Clone + Send + Sync + 'static {
    /// Spawns a future onto the background runtime.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns a future that resolves once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static;
}
