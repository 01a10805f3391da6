//! Connection pools.
//!
//! Pools compose. The client builds, per destination:
//!
//! ```text
//! HttpOrHttp2Pool
//!   └─ BoundedPool ─ SimplePool                               (HTTP/1.1)
//!   └─ BoundedPool ─ Http2MultiplexedPool ─ SimplePool        (HTTP/2)
//! ```
//!
//! Each layer keeps its state on its own [`EventLoop`](crate::event_loop)
//! and talks to the layer below only through [`ChannelPool`].

use crate::connection::Channel;
use crate::error::TransportError;
use futures_lite::future::Boxed;
use tokio::sync::oneshot;

pub mod bounded;
mod lease;
pub mod negotiating;
pub mod simple;

pub use bounded::BoundedPool;
pub use lease::Lease;
pub use negotiating::HttpOrHttp2Pool;
pub use simple::SimplePool;

/// A lease/return pool of channels.
///
/// `release` queues its work before returning, so dropping the returned
/// future does not undo the release.
pub trait ChannelPool: Send + Sync + 'static {
    fn acquire(&self) -> Boxed<anyhow::Result<Channel>>;

    fn release(&self, channel: Channel) -> Boxed<anyhow::Result<()>>;

    /// Closes idle channels, fails waiters and closes the pools below.
    fn close(&self);
}

pub(crate) type Waiter = oneshot::Sender<anyhow::Result<Channel>>;

/// Hands `channel` to `waiter`, giving it back if the waiter is gone.
pub(crate) fn hand_over(waiter: Waiter, channel: Channel) -> Result<(), Channel> {
    match waiter.send(Ok(channel)) {
        Ok(()) => Ok(()),
        Err(Ok(channel)) => Err(channel),
        Err(Err(_)) => Ok(()),
    }
}

/// Fails every waiter. The first gets `error` itself, the rest a copy of
/// its message.
pub(crate) fn fail_all(waiters: Vec<Waiter>, error: anyhow::Error) {
    let message = format!("{error:#}");
    let mut first = Some(error);
    for waiter in waiters {
        let error = first
            .take()
            .unwrap_or_else(|| TransportError::AcquireFailed(message.clone().into()).into());
        let _ = waiter.send(Err(error));
    }
}

/// Awaits the reply of an acquire queued on an event loop.
pub(crate) fn await_reply(
    queued: bool,
    reply: oneshot::Receiver<anyhow::Result<Channel>>,
) -> Boxed<anyhow::Result<Channel>> {
    Box::pin(async move {
        if !queued {
            return Err(TransportError::PoolClosed.into());
        }
        reply
            .await
            .map_err(|_| anyhow::Error::new(TransportError::PoolClosed))?
    })
}
