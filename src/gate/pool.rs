//! Bounded background worker pool
//!
//! Notices, deploy requests and deferred aborts run here, never on the
//! caller that is suspending or resuming the workflow.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::error;

/// Default number of concurrent background jobs
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(runtime: Handle, workers: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Pool on the runtime of the calling task. Panics outside a tokio runtime.
    pub fn current(workers: usize) -> Self {
        Self::new(Handle::current(), workers)
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Run `task` once a worker slot is free
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            run_guarded(task).await;
        })
    }

    /// Like [`WorkerPool::spawn`], handing back the task's output, or `None`
    /// when it panicked. Dropping the handle does not cancel the task.
    pub fn spawn_with_output<F, T>(&self, task: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            run_guarded(task).await
        })
    }

    /// Run a long-lived task that takes slots itself, per unit of work,
    /// through [`WorkerPool::acquire`]
    pub fn spawn_listener<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(async move {
            run_guarded(task).await;
        })
    }

    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

async fn run_guarded<F, T>(task: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(output) => Some(output),
        Err(_) => {
            error!("background gate task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let pool = WorkerPool::current(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        pool.spawn(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let pool = WorkerPool::current(1);
        let handle = pool.spawn(async {
            panic!("boom");
        });
        assert!(handle.await.is_ok());
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_output_survives_dropped_handle() {
        let pool = WorkerPool::current(1);
        let (tx, rx) = tokio::sync::oneshot::channel();

        drop(pool.spawn_with_output(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send(7).unwrap();
        }));

        assert_eq!(rx.await.unwrap(), 7);
        assert_eq!(pool.spawn_with_output(async { 3 }).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_panicking_output_task_is_none() {
        let pool = WorkerPool::current(1);
        let handle = pool.spawn_with_output(async {
            let empty: Vec<u32> = Vec::new();
            empty[0]
        });
        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_zero_workers_still_runs() {
        let pool = WorkerPool::current(0);
        assert_eq!(pool.available(), 1);
    }
}
