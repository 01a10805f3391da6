use super::ChannelPool;
use crate::connection::{Channel, ChannelId};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Shared ownership of one leased channel.
///
/// Clones of a lease travel to every place that may end the request (the
/// response adapter, the frame listener, the executor's `abort`, the body
/// sink's failure callback). Whichever gets there first takes the channel
/// and returns it to the pool; every later attempt is a no-op.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    pool: Arc<dyn ChannelPool>,
    channel_id: ChannelId,
    channel: Mutex<Option<Channel>>,
}

impl Lease {
    pub fn new(pool: Arc<dyn ChannelPool>, channel: Channel) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                pool,
                channel_id: channel.id(),
                channel: Mutex::new(Some(channel)),
            }),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel_id
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    /// Runs `f` on the channel unless it was already returned.
    pub fn with_channel<T>(&self, f: impl FnOnce(&mut Channel) -> T) -> Option<T> {
        self.lock().as_mut().map(f)
    }

    /// Returns the channel to its pool. Returns `false` if this or another
    /// clone already did.
    pub fn release(&self) -> bool {
        let Some(channel) = self.take() else {
            return false;
        };
        trace!(channel = %self.inner.channel_id, "releasing channel");
        drop(self.inner.pool.release(channel));
        true
    }

    /// Closes the channel, then returns it to its pool.
    pub fn close_and_release(&self) -> bool {
        let Some(channel) = self.take() else {
            return false;
        };
        trace!(channel = %self.inner.channel_id, "closing and releasing channel");
        channel.close();
        drop(self.inner.pool.release(channel));
        true
    }

    fn take(&self) -> Option<Channel> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Channel>> {
        self.inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("channel", &self.inner.channel_id)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubPool;

    #[tokio::test]
    async fn release_happens_once_across_clones() {
        let pool = StubPool::streams(4);
        let channel = pool.acquire().await.unwrap();
        let lease = Lease::new(pool.clone(), channel);
        let other = lease.clone();

        assert!(lease.release());
        assert!(!other.release());
        assert!(!other.close_and_release());
        assert!(lease.is_released());
        assert_eq!(pool.released(), 1);
    }

    #[tokio::test]
    async fn close_and_release_closes_first() {
        let pool = StubPool::streams(4);
        let channel = pool.acquire().await.unwrap();
        let lease = Lease::new(pool.clone(), channel);

        assert!(lease.close_and_release());
        assert_eq!(pool.released(), 1);
        assert_eq!(pool.released_open(), 0);
        assert!(lease.with_channel(|_| ()).is_none());
    }
}
