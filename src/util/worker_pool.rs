//! Bounded concurrency for expensive operations.
//!
//! A [`WorkerPool`] admits at most N operations at a time; excess callers
//! wait on a FIFO. There is no timeout and no cancellation of admitted
//! work. The fileDB wraps each of its public operations in a pool of
//! size 100 to bound open file descriptors.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Admits up to a fixed number of concurrent operations.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Run `op` once a slot is free. Waiters are admitted in FIFO order.
    pub async fn run<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // The semaphore is never closed, so acquire cannot fail.
        let _permit = self
            .permits
            .acquire()
            .await
            .unwrap_or_else(|_| unreachable!("worker pool semaphore closed"));
        op().await
    }

    /// Configured concurrency limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
