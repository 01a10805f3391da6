use super::{ChannelPool, Waiter, await_reply, hand_over};
use crate::AsyncRuntime;
use crate::connection::{Channel, Connection};
use crate::error::TransportError;
use crate::event_loop::EventLoop;
use crate::pipeline::PipelineInitializer;
use crate::transport::TransportPlugin;
use futures_lite::future::Boxed;
use http::Uri;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// The physical connection pool for one destination.
///
/// Idle connections are reused most-recently-released last; a connection
/// found closed on acquire is discarded. There is no limit here, the
/// [`BoundedPool`](super::BoundedPool) above provides it.
pub struct SimplePool<T, R> {
    connector: Arc<Connector<T, R>>,
    event_loop: EventLoop<Idle>,
}

struct Connector<T, R> {
    transport: Arc<T>,
    destination: Uri,
    initializer: PipelineInitializer<R>,
}

#[derive(Default)]
struct Idle {
    connections: VecDeque<Connection>,
    closed: bool,
}

impl<T, R> SimplePool<T, R>
where
    T: TransportPlugin,
    R: AsyncRuntime,
{
    pub fn new(transport: Arc<T>, destination: Uri, initializer: PipelineInitializer<R>) -> Self {
        let event_loop = EventLoop::spawn(initializer.runtime(), Idle::default());
        Self {
            connector: Arc::new(Connector {
                transport,
                destination,
                initializer,
            }),
            event_loop,
        }
    }

    pub fn destination(&self) -> &Uri {
        &self.connector.destination
    }

    /// Number of idle connections, for diagnostics.
    pub fn idle(&self) -> Boxed<anyhow::Result<usize>> {
        self.event_loop.submit(|idle| idle.connections.len())
    }
}

impl<T, R> Connector<T, R>
where
    T: TransportPlugin,
    R: AsyncRuntime,
{
    fn spawn_connect(self: &Arc<Self>, waiter: Waiter, event_loop: EventLoop<Idle>) {
        let this = self.clone();
        self.initializer.runtime().spawn(async move {
            match this.connect().await {
                Ok(connection) => {
                    if let Err(channel) = hand_over(waiter, Channel::Connection(connection)) {
                        trace!("acquirer went away; keeping the new connection idle");
                        if let Channel::Connection(connection) = channel {
                            event_loop.execute(move |idle| idle.offer(connection));
                        }
                    }
                }
                Err(error) => {
                    debug!(
                        destination = %this.destination,
                        error = %format_args!("{error:#}"),
                        "failed to open connection"
                    );
                    let _ = waiter.send(Err(error));
                }
            }
        });
    }

    async fn connect(&self) -> anyhow::Result<Connection> {
        let io = self.transport.connect(&self.destination).await?;
        self.initializer.channel_created(io).await
    }
}

impl Idle {
    fn offer(&mut self, connection: Connection) {
        if self.closed || !connection.is_open() {
            debug!(connection = %connection.id(), "dropping connection instead of keeping it idle");
            connection.close();
        } else {
            self.connections.push_back(connection);
        }
    }

    fn take_open(&mut self) -> Option<Connection> {
        while let Some(connection) = self.connections.pop_front() {
            if connection.is_open() {
                return Some(connection);
            }
            debug!(connection = %connection.id(), "discarding closed idle connection");
        }
        None
    }
}

impl<T, R> ChannelPool for SimplePool<T, R>
where
    T: TransportPlugin,
    R: AsyncRuntime,
{
    fn acquire(&self) -> Boxed<anyhow::Result<Channel>> {
        let (waiter, reply) = oneshot::channel();
        let connector = self.connector.clone();
        let event_loop = self.event_loop.clone();
        let queued = self.event_loop.execute(move |idle| {
            if idle.closed {
                let _ = waiter.send(Err(TransportError::PoolClosed.into()));
                return;
            }
            match idle.take_open() {
                Some(connection) => {
                    trace!(connection = %connection.id(), "reusing idle connection");
                    if let Err(Channel::Connection(connection)) =
                        hand_over(waiter, Channel::Connection(connection))
                    {
                        idle.offer(connection);
                    }
                }
                None => connector.spawn_connect(waiter, event_loop),
            }
        });
        await_reply(queued, reply)
    }

    fn release(&self, channel: Channel) -> Boxed<anyhow::Result<()>> {
        let mut connection = match channel {
            Channel::Connection(connection) => connection,
            Channel::Stream(stream) => {
                stream.close();
                return Box::pin(async move {
                    Err(TransportError::Protocol(format!(
                        "stream {} cannot be released to a physical connection pool",
                        stream.id()
                    ))
                    .into())
                });
            }
        };
        self.connector.initializer.channel_released(&mut connection);
        self.event_loop.submit(move |idle| idle.offer(connection))
    }

    fn close(&self) {
        self.event_loop.execute(|idle| {
            idle.closed = true;
            for connection in idle.connections.drain(..) {
                connection.close();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, Protocol};
    use crate::connection::{ChannelId, StreamChannel};
    use crate::http2::Http2Handle;
    use crate::testing::TestRuntime;
    use crate::transport::BidiStream;
    use futures_lite::io::{AsyncRead, AsyncWrite};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::io;
    use tokio::io::DuplexStream;
    use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

    struct Pipe(Compat<DuplexStream>);

    impl AsyncRead for Pipe {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Pipe {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_close(cx)
        }
    }

    impl BidiStream for Pipe {}

    /// Hands out in-memory pipes whose far ends stay open and silent.
    #[derive(Default)]
    struct Pipes {
        connects: AtomicUsize,
        refuse: bool,
        peers: Mutex<Vec<DuplexStream>>,
    }

    impl TransportPlugin for Pipes {
        type Io = Pipe;

        async fn connect(&self, uri: &Uri) -> anyhow::Result<Pipe> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                anyhow::bail!("connection to {uri} refused");
            }
            let (client, server) = tokio::io::duplex(1024);
            self.peers.lock().unwrap().push(server);
            Ok(Pipe(client.compat()))
        }
    }

    fn pool(transport: Arc<Pipes>) -> SimplePool<Pipes, TestRuntime> {
        let config = ClientConfig::default().with_protocol(Protocol::Http1);
        SimplePool::new(
            transport,
            "http://example.com/".parse().unwrap(),
            PipelineInitializer::new(TestRuntime, &config),
        )
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let transport = Arc::new(Pipes::default());
        let pool = pool(transport.clone());

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        pool.release(first).await.unwrap();
        assert_eq!(pool.idle().await.unwrap(), 1);

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(pool.idle().await.unwrap(), 0);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_connection_is_not_kept_idle() {
        let transport = Arc::new(Pipes::default());
        let pool = pool(transport.clone());

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        first.close();
        pool.release(first).await.unwrap();
        assert_eq!(pool.idle().await.unwrap(), 0);

        let second = pool.acquire().await.unwrap();
        assert_ne!(second.id(), id);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_failure_reaches_the_acquirer() {
        let transport = Arc::new(Pipes {
            refuse: true,
            ..Pipes::default()
        });
        let pool = pool(transport);

        let error = pool.acquire().await.unwrap_err();

        assert!(format!("{error:#}").contains("refused"));
    }

    #[tokio::test]
    async fn close_rejects_acquires_and_drops_idle_connections() {
        let transport = Arc::new(Pipes::default());
        let pool = pool(transport);
        let channel = pool.acquire().await.unwrap();
        pool.release(channel).await.unwrap();

        pool.close();

        assert_eq!(pool.idle().await.unwrap(), 0);
        let error = pool.acquire().await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn streams_cannot_be_released_here() {
        let pool = pool(Arc::new(Pipes::default()));
        let (handle, _commands) = Http2Handle::new(ChannelId::next(), 1);

        let error = pool
            .release(Channel::Stream(StreamChannel::new(handle)))
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<TransportError>(),
            Some(TransportError::Protocol(_))
        ));
    }
}
