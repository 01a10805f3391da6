use super::{ChannelPool, Waiter, await_reply, hand_over};
use crate::AsyncRuntime;
use crate::config::ClientConfig;
use crate::connection::Channel;
use crate::error::TransportError;
use crate::event_loop::EventLoop;
use futures_lite::future::Boxed;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Limits enforced by a [`BoundedPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_leases: usize,
    pub max_pending_acquires: usize,
    pub acquire_timeout: Duration,
}

impl From<&ClientConfig> for Limits {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_leases: config.max_connections(),
            max_pending_acquires: config.max_pending_acquires(),
            acquire_timeout: config.connection_acquire_timeout(),
        }
    }
}

/// Caps the number of concurrent leases of the pool it wraps.
///
/// Acquires beyond the cap wait in FIFO order for a release. A waiter fails
/// with [`TransportError::AcquireTimeout`] once the acquire timeout passes,
/// and acquires beyond the pending limit fail immediately with
/// [`TransportError::TooManyPendingAcquires`].
pub struct BoundedPool<R> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    inner: Arc<dyn ChannelPool>,
    event_loop: EventLoop<Bounded>,
    runtime: R,
}

struct Bounded {
    limits: Limits,
    leased: usize,
    pending: VecDeque<Pending>,
    next_pending: u64,
    closed: bool,
}

struct Pending {
    id: u64,
    waiter: Waiter,
}

impl<R: AsyncRuntime> BoundedPool<R> {
    pub fn new(inner: Arc<dyn ChannelPool>, limits: Limits, runtime: R) -> Self {
        let state = Bounded {
            limits,
            leased: 0,
            pending: VecDeque::new(),
            next_pending: 0,
            closed: false,
        };
        let event_loop = EventLoop::spawn(&runtime, state);
        Self {
            shared: Arc::new(Shared {
                inner,
                event_loop,
                runtime,
            }),
        }
    }

    /// Current `(leased, pending)` counts, for diagnostics.
    pub fn usage(&self) -> Boxed<anyhow::Result<(usize, usize)>> {
        self.shared
            .event_loop
            .submit(|bounded| (bounded.leased, bounded.pending.len()))
    }
}

impl<R: AsyncRuntime> Shared<R> {
    /// Acquires from the inner pool for a waiter that already holds a lease
    /// slot. The slot is given back if the acquire fails or nobody waits.
    fn start_acquire(self: &Arc<Self>, waiter: Waiter) {
        let shared = self.clone();
        self.runtime.spawn(async move {
            match shared.inner.acquire().await {
                Ok(channel) => {
                    if let Err(channel) = hand_over(waiter, channel) {
                        trace!("acquirer went away; returning channel");
                        drop(shared.inner.release(channel));
                        shared.slot_returned();
                    }
                }
                Err(error) => {
                    shared.slot_returned();
                    let _ = waiter.send(Err(error));
                }
            }
        });
    }

    fn slot_returned(self: &Arc<Self>) {
        let shared = self.clone();
        self.event_loop
            .execute(move |bounded| bounded.slot_returned(&shared));
    }

    fn schedule_timeout(self: &Arc<Self>, pending: u64, timeout: Duration) {
        let sleep = self.runtime.sleep(timeout);
        let event_loop = self.event_loop.clone();
        self.runtime.spawn(async move {
            sleep.await;
            event_loop.execute(move |bounded| bounded.expire(pending));
        });
    }
}

impl Bounded {
    fn acquire<R: AsyncRuntime>(&mut self, waiter: Waiter, shared: &Arc<Shared<R>>) {
        if self.closed {
            let _ = waiter.send(Err(TransportError::PoolClosed.into()));
            return;
        }
        if self.leased < self.limits.max_leases {
            self.leased += 1;
            shared.start_acquire(waiter);
            return;
        }
        if self.pending.len() >= self.limits.max_pending_acquires {
            debug!(
                limit = self.limits.max_pending_acquires,
                "rejecting acquire: pending queue is full"
            );
            let _ = waiter.send(Err(TransportError::TooManyPendingAcquires(
                self.limits.max_pending_acquires,
            )
            .into()));
            return;
        }
        let id = self.next_pending;
        self.next_pending += 1;
        trace!(pending = id, leased = self.leased, "all leases taken; queueing acquire");
        self.pending.push_back(Pending { id, waiter });
        shared.schedule_timeout(id, self.limits.acquire_timeout);
    }

    fn slot_returned<R: AsyncRuntime>(&mut self, shared: &Arc<Shared<R>>) {
        self.leased = self.leased.saturating_sub(1);
        while self.leased < self.limits.max_leases {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            if next.waiter.is_closed() {
                continue;
            }
            self.leased += 1;
            shared.start_acquire(next.waiter);
        }
    }

    fn expire(&mut self, id: u64) {
        let Some(index) = self.pending.iter().position(|pending| pending.id == id) else {
            return;
        };
        if let Some(pending) = self.pending.remove(index) {
            debug!(pending = id, "acquire timed out");
            let _ = pending.waiter.send(Err(
                TransportError::AcquireTimeout(self.limits.acquire_timeout).into(),
            ));
        }
    }

    fn close(&mut self) {
        self.closed = true;
        for pending in self.pending.drain(..) {
            let _ = pending.waiter.send(Err(TransportError::PoolClosed.into()));
        }
    }
}

impl<R: AsyncRuntime> ChannelPool for BoundedPool<R> {
    fn acquire(&self) -> Boxed<anyhow::Result<Channel>> {
        let (waiter, reply) = oneshot::channel();
        let shared = self.shared.clone();
        let queued = self
            .shared
            .event_loop
            .execute(move |bounded| bounded.acquire(waiter, &shared));
        await_reply(queued, reply)
    }

    fn release(&self, channel: Channel) -> Boxed<anyhow::Result<()>> {
        let released = self.shared.inner.release(channel);
        self.shared.slot_returned();
        released
    }

    fn close(&self) {
        self.shared.event_loop.execute(Bounded::close);
        self.shared.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubPool, TestRuntime};

    fn limits(max_leases: usize, max_pending_acquires: usize, timeout_ms: u64) -> Limits {
        Limits {
            max_leases,
            max_pending_acquires,
            acquire_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn release_hands_capacity_to_the_oldest_waiter() {
        let inner = StubPool::streams(10);
        let pool = BoundedPool::new(inner.clone(), limits(1, 10, 5_000), TestRuntime);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire();
        let third = pool.acquire();
        assert_eq!(pool.usage().await.unwrap(), (1, 2));

        pool.release(first).await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(pool.usage().await.unwrap(), (1, 1));

        pool.release(second).await.unwrap();
        let third = third.await.unwrap();
        pool.release(third).await.unwrap();

        assert_eq!(pool.usage().await.unwrap(), (0, 0));
        assert_eq!(inner.acquired(), 3);
    }

    #[tokio::test]
    async fn queued_acquire_times_out() {
        let pool = BoundedPool::new(StubPool::streams(10), limits(1, 10, 20), TestRuntime);
        let _held = pool.acquire().await.unwrap();

        let error = pool.acquire().await.unwrap_err();

        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::AcquireTimeout(_))
        ));
        assert_eq!(pool.usage().await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn full_pending_queue_rejects_immediately() {
        let pool = BoundedPool::new(StubPool::streams(10), limits(1, 1, 5_000), TestRuntime);
        let _held = pool.acquire().await.unwrap();
        let _queued = pool.acquire();

        let error = pool.acquire().await.unwrap_err();

        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::TooManyPendingAcquires(1))
        ));
    }

    #[tokio::test]
    async fn failed_inner_acquire_frees_the_slot() {
        let inner = StubPool::failing();
        let pool = BoundedPool::new(inner.clone(), limits(1, 10, 5_000), TestRuntime);

        assert!(pool.acquire().await.is_err());
        assert!(pool.acquire().await.is_err());
        assert_eq!(pool.usage().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn close_fails_waiters_and_closes_inner() {
        let inner = StubPool::streams(10);
        let pool = BoundedPool::new(inner.clone(), limits(1, 10, 5_000), TestRuntime);
        let _held = pool.acquire().await.unwrap();
        let waiting = pool.acquire();

        pool.close();

        let error = waiting.await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::PoolClosed)
        ));
        assert!(inner.is_closed());
    }
}
