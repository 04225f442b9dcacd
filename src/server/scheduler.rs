use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::error;

use super::wire::Method;

/// Where a request runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    /// On the connection's receive task, before the next frame is read.
    Inline,
    /// On the shared worker pool, in no particular order.
    Pooled,
}

impl Execution {
    /// GET_CLOCKS is cheap and polled by callers deciding whether to
    /// proceed, so it runs inline and sees the connection's earlier requests
    /// in arrival order. Everything else may be arbitrarily expensive.
    pub fn for_method(method: Option<Method>) -> Self {
        match method {
            Some(Method::GetClocks) => Execution::Inline,
            _ => Execution::Pooled,
        }
    }
}

/// A fixed number of slots for running requests, shared by every
/// connection. Work queues up behind the slots without bound; the slot
/// count never changes after construction.
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently holding a slot.
    pub fn busy(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Runs `job` on the blocking thread pool once a slot frees up, then
    /// hands its output to `finish`. The slot is released as soon as `job`
    /// returns, so a `finish` stuck on a slow peer never holds up other
    /// connections.
    pub fn spawn<J, T, F, Fut>(&self, job: J, finish: F) -> JoinHandle<()>
    where
        J: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let slots = self.slots.clone();
        tokio::spawn(async move {
            let output = {
                let Ok(_slot) = slots.acquire_owned().await else {
                    // the semaphore is never closed
                    return;
                };
                tokio::task::spawn_blocking(job).await
            };
            match output {
                Ok(output) => finish(output).await,
                Err(e) => error!(error = %e, "pooled job did not complete"),
            }
        })
    }
}
