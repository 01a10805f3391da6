use super::{BoundedPool, ChannelPool, Waiter, await_reply, fail_all, hand_over, bounded::Limits};
use crate::AsyncRuntime;
use crate::config::ClientConfig;
use crate::connection::Channel;
use crate::error::TransportError;
use crate::event_loop::EventLoop;
use crate::http2::Http2MultiplexedPool;
use futures_lite::future::Boxed;
use http::Version;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Learns the destination's protocol from its first connection, then
/// serves every acquire through the matching pool stack:
///
/// - HTTP/1.1: a [`BoundedPool`] over the physical pool
/// - HTTP/2: a [`BoundedPool`] over an [`Http2MultiplexedPool`] over the
///   physical pool
///
/// The connection opened for negotiation goes back to the physical pool and
/// is reused. If it fails, the acquires waiting on it fail and the next acquire
/// negotiates again.
pub struct HttpOrHttp2Pool<R> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    physical: Arc<dyn ChannelPool>,
    event_loop: EventLoop<Negotiation>,
    runtime: R,
    limits: Limits,
    max_streams_per_connection: usize,
}

#[derive(Default)]
struct Negotiation {
    protocol_pool: Option<Arc<dyn ChannelPool>>,
    version: Option<Version>,
    waiters: Vec<Waiter>,
    negotiating: bool,
    closed: bool,
}

impl<R: AsyncRuntime> HttpOrHttp2Pool<R> {
    pub fn new(physical: Arc<dyn ChannelPool>, config: &ClientConfig, runtime: R) -> Self {
        let event_loop = EventLoop::spawn(&runtime, Negotiation::default());
        Self {
            shared: Arc::new(Shared {
                physical,
                event_loop,
                runtime,
                limits: Limits::from(config),
                max_streams_per_connection: config.max_streams_per_connection(),
            }),
        }
    }

    /// The negotiated protocol, once known.
    pub fn protocol(&self) -> Boxed<anyhow::Result<Option<Version>>> {
        self.shared.event_loop.submit(|negotiation| negotiation.version)
    }
}

impl<R: AsyncRuntime> Shared<R> {
    fn negotiate(self: &Arc<Self>) {
        let shared = self.clone();
        self.runtime.spawn(async move {
            let first = shared.physical.acquire().await;
            let this = shared.clone();
            shared
                .event_loop
                .execute(move |negotiation| negotiation.negotiated(first, &this));
        });
    }

    fn protocol_pool(&self, version: Version) -> Arc<dyn ChannelPool> {
        let runtime = self.runtime.clone();
        if version == Version::HTTP_2 {
            let multiplexed = Http2MultiplexedPool::new(
                self.physical.clone(),
                self.max_streams_per_connection,
                runtime.clone(),
            );
            Arc::new(BoundedPool::new(Arc::new(multiplexed), self.limits, runtime))
        } else {
            Arc::new(BoundedPool::new(self.physical.clone(), self.limits, runtime))
        }
    }

    /// Acquires through the protocol pool on behalf of `waiter`.
    fn forward(&self, pool: Arc<dyn ChannelPool>, waiter: Waiter) {
        self.runtime.spawn(async move {
            match pool.acquire().await {
                Ok(channel) => {
                    if let Err(channel) = hand_over(waiter, channel) {
                        trace!("acquirer went away; returning channel");
                        drop(pool.release(channel));
                    }
                }
                Err(error) => {
                    let _ = waiter.send(Err(error));
                }
            }
        });
    }
}

impl Negotiation {
    fn acquire<R: AsyncRuntime>(&mut self, waiter: Waiter, shared: &Arc<Shared<R>>) {
        if self.closed {
            let _ = waiter.send(Err(TransportError::PoolClosed.into()));
            return;
        }
        if let Some(pool) = &self.protocol_pool {
            shared.forward(pool.clone(), waiter);
            return;
        }
        self.waiters.push(waiter);
        if !self.negotiating {
            self.negotiating = true;
            debug!("negotiating protocol");
            shared.negotiate();
        }
    }

    fn negotiated<R: AsyncRuntime>(
        &mut self,
        first: anyhow::Result<Channel>,
        shared: &Arc<Shared<R>>,
    ) {
        self.negotiating = false;
        let waiters = std::mem::take(&mut self.waiters);

        let channel = match first {
            Ok(channel) => channel,
            Err(error) => {
                debug!(
                    error = %format_args!("{error:#}"),
                    waiting = waiters.len(),
                    "protocol negotiation failed"
                );
                fail_all(waiters, error);
                return;
            }
        };

        let version = channel.version();
        drop(shared.physical.release(channel));
        if self.closed {
            fail_all(waiters, TransportError::PoolClosed.into());
            return;
        }

        debug!(?version, "protocol negotiated");
        self.version = Some(version);
        let pool = shared.protocol_pool(version);
        for waiter in waiters {
            shared.forward(pool.clone(), waiter);
        }
        self.protocol_pool = Some(pool);
    }

    fn close(&mut self, physical: &Arc<dyn ChannelPool>) {
        self.closed = true;
        fail_all(std::mem::take(&mut self.waiters), TransportError::PoolClosed.into());
        match &self.protocol_pool {
            Some(pool) => pool.close(),
            None => physical.close(),
        }
    }
}

impl<R: AsyncRuntime> ChannelPool for HttpOrHttp2Pool<R> {
    fn acquire(&self) -> Boxed<anyhow::Result<Channel>> {
        let (waiter, reply) = oneshot::channel();
        let shared = self.shared.clone();
        let queued = self
            .shared
            .event_loop
            .execute(move |negotiation| negotiation.acquire(waiter, &shared));
        await_reply(queued, reply)
    }

    fn release(&self, channel: Channel) -> Boxed<anyhow::Result<()>> {
        let physical = self.shared.physical.clone();
        let released = self.shared.event_loop.submit(move |negotiation| {
            match &negotiation.protocol_pool {
                Some(pool) => pool.release(channel),
                None => physical.release(channel),
            }
        });
        Box::pin(async move { released.await?.await })
    }

    fn close(&self) {
        let physical = self.shared.physical.clone();
        self.shared
            .event_loop
            .execute(move |negotiation| negotiation.close(&physical));
    }
}
