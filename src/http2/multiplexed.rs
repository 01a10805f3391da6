use crate::AsyncRuntime;
use crate::connection::{Channel, ChannelId, Connection, StreamChannel};
use crate::error::TransportError;
use crate::event_loop::EventLoop;
use crate::pool::{ChannelPool, Waiter, await_reply, fail_all, hand_over};
use futures_lite::future::Boxed;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Hands out HTTP/2 stream slots over the physical connections of an inner
/// pool.
///
/// Connections are tried in creation order and the first with a free slot
/// wins, so a new physical connection is only requested once every existing
/// one is saturated. A slot count is the smaller of the configured
/// per-connection limit and the peer's `SETTINGS_MAX_CONCURRENT_STREAMS`.
/// There is no global limit here.
pub struct Http2MultiplexedPool<R> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    inner: Arc<dyn ChannelPool>,
    event_loop: EventLoop<Records>,
    runtime: R,
}

struct Records {
    max_streams: usize,
    records: Vec<MultiplexedChannelRecord>,
    next_record: u64,
    closed: bool,
}

struct MultiplexedChannelRecord {
    id: u64,
    connection: RecordConnection,
    max_streams: usize,
    leased: usize,
}

enum RecordConnection {
    Connecting(Vec<Waiter>),
    Ready(Connection),
}

/// Point-in-time view of one physical connection of the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordSnapshot {
    /// `None` while the connection is still being established.
    pub connection: Option<ChannelId>,
    pub leased: usize,
    pub capacity: usize,
    pub accepts_streams: bool,
}

impl<R: AsyncRuntime> Http2MultiplexedPool<R> {
    pub fn new(inner: Arc<dyn ChannelPool>, max_streams_per_connection: usize, runtime: R) -> Self {
        let records = Records {
            max_streams: max_streams_per_connection.max(1),
            records: Vec::new(),
            next_record: 0,
            closed: false,
        };
        let event_loop = EventLoop::spawn(&runtime, records);
        Self {
            shared: Arc::new(Shared {
                inner,
                event_loop,
                runtime,
            }),
        }
    }

    /// The records in creation order.
    pub fn snapshot(&self) -> Boxed<anyhow::Result<Vec<RecordSnapshot>>> {
        self.shared.event_loop.submit(|records| {
            records
                .records
                .iter()
                .map(MultiplexedChannelRecord::snapshot)
                .collect()
        })
    }
}

impl<R: AsyncRuntime> Shared<R> {
    fn connect(self: &Arc<Self>, record: u64) {
        let shared = self.clone();
        self.runtime.spawn(async move {
            let result = shared.inner.acquire().await;
            let this = shared.clone();
            shared
                .event_loop
                .execute(move |records| records.connected(record, result, &this));
        });
    }
}

impl MultiplexedChannelRecord {
    fn capacity(&self) -> usize {
        match &self.connection {
            RecordConnection::Ready(connection) => connection
                .max_concurrent_streams()
                .map_or(self.max_streams, |peer| peer.min(self.max_streams))
                .max(1),
            RecordConnection::Connecting(_) => self.max_streams,
        }
    }

    fn accepts_streams(&self) -> bool {
        match &self.connection {
            RecordConnection::Connecting(_) => true,
            RecordConnection::Ready(connection) => connection.accepts_streams(),
        }
    }

    fn has_free_slot(&self) -> bool {
        self.accepts_streams() && self.leased < self.capacity()
    }

    fn is_closed(&self) -> bool {
        matches!(&self.connection, RecordConnection::Ready(connection) if !connection.is_open())
    }

    fn connection_id(&self) -> Option<ChannelId> {
        match &self.connection {
            RecordConnection::Ready(connection) => Some(connection.id()),
            RecordConnection::Connecting(_) => None,
        }
    }

    fn lease(&mut self, waiter: Waiter) {
        self.leased += 1;
        match &mut self.connection {
            RecordConnection::Connecting(waiters) => waiters.push(waiter),
            RecordConnection::Ready(connection) => {
                let Some(handle) = connection.http2_handle() else {
                    self.leased -= 1;
                    let _ = waiter.send(Err(TransportError::Protocol(format!(
                        "connection {} is not an HTTP/2 connection",
                        connection.id()
                    ))
                    .into()));
                    return;
                };
                let stream = StreamChannel::new(handle.clone());
                trace!(
                    record = self.id,
                    stream = %stream.id(),
                    leased = self.leased,
                    "leasing stream"
                );
                if let Err(channel) = hand_over(waiter, Channel::Stream(stream)) {
                    channel.close();
                    self.leased -= 1;
                }
            }
        }
    }

    fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            connection: self.connection_id(),
            leased: self.leased,
            capacity: self.capacity(),
            accepts_streams: self.accepts_streams(),
        }
    }
}

impl Records {
    fn acquire<R: AsyncRuntime>(&mut self, waiter: Waiter, shared: &Arc<Shared<R>>) {
        if self.closed {
            let _ = waiter.send(Err(TransportError::PoolClosed.into()));
            return;
        }
        self.prune(shared);

        if let Some(record) = self.records.iter_mut().find(|record| record.has_free_slot()) {
            record.lease(waiter);
            return;
        }

        let id = self.next_record;
        self.next_record += 1;
        debug!(
            record = id,
            connections = self.records.len(),
            "every HTTP/2 connection is saturated; opening another"
        );
        self.records.push(MultiplexedChannelRecord {
            id,
            connection: RecordConnection::Connecting(vec![waiter]),
            max_streams: self.max_streams,
            leased: 1,
        });
        shared.connect(id);
    }

    fn connected<R: AsyncRuntime>(
        &mut self,
        record_id: u64,
        result: anyhow::Result<Channel>,
        shared: &Arc<Shared<R>>,
    ) {
        let Some(index) = self.records.iter().position(|record| record.id == record_id) else {
            if let Ok(channel) = result {
                drop(shared.inner.release(channel));
            }
            return;
        };

        match result {
            Ok(Channel::Connection(connection)) if connection.http2_handle().is_some() => {
                let overflow = {
                    let record = &mut self.records[index];
                    debug!(
                        record = record_id,
                        connection = %connection.id(),
                        "HTTP/2 connection ready"
                    );
                    let waiters = match std::mem::replace(
                        &mut record.connection,
                        RecordConnection::Ready(connection),
                    ) {
                        RecordConnection::Connecting(waiters) => waiters,
                        RecordConnection::Ready(_) => Vec::new(),
                    };
                    record.leased -= waiters.len();

                    let mut overflow = Vec::new();
                    for waiter in waiters {
                        if record.has_free_slot() {
                            record.lease(waiter);
                        } else {
                            overflow.push(waiter);
                        }
                    }
                    overflow
                };
                for waiter in overflow {
                    self.acquire(waiter, shared);
                }
            }
            Ok(channel) => {
                let record = self.records.remove(index);
                let error = TransportError::Protocol(format!(
                    "channel {} is not an HTTP/2 connection",
                    channel.id()
                ));
                drop(shared.inner.release(channel));
                record.fail_waiters(error.into());
            }
            Err(error) => {
                let record = self.records.remove(index);
                debug!(
                    record = record_id,
                    error = %format_args!("{error:#}"),
                    "HTTP/2 connection failed to open"
                );
                record.fail_waiters(error);
            }
        }
    }

    fn release<R: AsyncRuntime>(
        &mut self,
        stream: StreamChannel,
        shared: &Arc<Shared<R>>,
    ) -> anyhow::Result<()> {
        stream.close();
        let parent = stream.parent_id();
        let Some(index) = self
            .records
            .iter()
            .position(|record| record.connection_id() == Some(parent))
        else {
            return Err(TransportError::Protocol(format!(
                "stream {} does not belong to this pool",
                stream.id()
            ))
            .into());
        };

        let record = &mut self.records[index];
        if record.leased == 0 {
            return Err(TransportError::Protocol(format!(
                "stream {} released more often than leased",
                stream.id()
            ))
            .into());
        }
        record.leased -= 1;
        trace!(
            record = record.id,
            stream = %stream.id(),
            leased = record.leased,
            "stream released"
        );

        if record.is_closed() && record.leased == 0 {
            self.retire(index, shared);
        }
        Ok(())
    }

    /// Drops records whose connection closed and has no streams left.
    fn prune<R: AsyncRuntime>(&mut self, shared: &Arc<Shared<R>>) {
        let mut index = 0;
        while index < self.records.len() {
            let record = &self.records[index];
            if record.is_closed() && record.leased == 0 {
                self.retire(index, shared);
            } else {
                index += 1;
            }
        }
    }

    fn retire<R: AsyncRuntime>(&mut self, index: usize, shared: &Arc<Shared<R>>) {
        let record = self.records.remove(index);
        if let RecordConnection::Ready(connection) = record.connection {
            debug!(
                record = record.id,
                connection = %connection.id(),
                "retiring closed HTTP/2 connection"
            );
            drop(shared.inner.release(Channel::Connection(connection)));
        }
    }

    fn close<R: AsyncRuntime>(&mut self, shared: &Arc<Shared<R>>) {
        self.closed = true;
        for record in self.records.drain(..) {
            match record.connection {
                RecordConnection::Connecting(waiters) => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(TransportError::PoolClosed.into()));
                    }
                }
                RecordConnection::Ready(connection) => {
                    connection.close();
                    drop(shared.inner.release(Channel::Connection(connection)));
                }
            }
        }
    }
}

impl MultiplexedChannelRecord {
    fn fail_waiters(self, error: anyhow::Error) {
        if let RecordConnection::Connecting(waiters) = self.connection {
            fail_all(waiters, error);
        }
    }
}

impl<R: AsyncRuntime> ChannelPool for Http2MultiplexedPool<R> {
    fn acquire(&self) -> Boxed<anyhow::Result<Channel>> {
        let (waiter, reply) = oneshot::channel();
        let shared = self.shared.clone();
        let queued = self
            .shared
            .event_loop
            .execute(move |records| records.acquire(waiter, &shared));
        await_reply(queued, reply)
    }

    fn release(&self, channel: Channel) -> Boxed<anyhow::Result<()>> {
        match channel {
            Channel::Stream(stream) => {
                let shared = self.shared.clone();
                let released = self
                    .shared
                    .event_loop
                    .submit(move |records| records.release(stream, &shared));
                Box::pin(async move { released.await? })
            }
            Channel::Connection(connection) => {
                self.shared.inner.release(Channel::Connection(connection))
            }
        }
    }

    fn close(&self) {
        let shared = self.shared.clone();
        self.shared
            .event_loop
            .execute(move |records| records.close(&shared));
        self.shared.inner.close();
    }
}
