//! Single-task actor that owns a piece of state.
//!
//! Every mutation of pool state is a closure submitted to the loop that
//! owns it, so the state itself is never shared or locked. Submission is
//! synchronous: the closure is queued before `execute`/`submit` return,
//! which keeps operations in submission order.

use crate::AsyncRuntime;
use crate::error::TransportError;
use futures_lite::future::Boxed;
use tokio::sync::{mpsc, oneshot};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

pub(crate) struct EventLoop<S> {
    tasks: mpsc::UnboundedSender<Task<S>>,
}

impl<S> Clone for EventLoop<S> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
        }
    }
}

impl<S: Send + 'static> EventLoop<S> {
    /// Spawns the loop. It runs until every handle is dropped.
    pub(crate) fn spawn<R: AsyncRuntime>(runtime: &R, mut state: S) -> Self {
        let (tasks, mut queue) = mpsc::unbounded_channel::<Task<S>>();
        runtime.spawn(async move {
            while let Some(task) = queue.recv().await {
                task(&mut state);
            }
        });
        Self { tasks }
    }

    /// Queues `task`. Returns `false` if the loop has stopped.
    pub(crate) fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tasks.send(Box::new(task)).is_ok()
    }

    /// Queues `task` and returns a future resolving to its result.
    pub(crate) fn submit<F, T>(&self, task: F) -> Boxed<anyhow::Result<T>>
    where
        F: FnOnce(&mut S) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let queued = self.execute(move |state| {
            let _ = reply.send(task(state));
        });
        Box::pin(async move {
            if !queued {
                return Err(TransportError::PoolClosed.into());
            }
            result.await.map_err(|_| TransportError::PoolClosed.into())
        })
    }
}
