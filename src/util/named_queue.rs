//! Named FIFO queues for in-order, mutually exclusive execution.
//!
//! Operations submitted under the same name run one at a time in
//! submission order. Distinct names are fully independent. A queue entry
//! exists only while operations are pending under its name and is
//! destroyed when drained.
//!
//! Used wherever a contended resource needs serialized access: one
//! indexer pass per branch, one writer per search response.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One live queue. The tokio mutex hands the lock to waiters in FIFO
/// order, which is what gives submission-order execution.
struct QueueEntry {
    lock: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
}

/// A registry of named FIFO queues.
pub struct NamedQueue {
    entries: Mutex<HashMap<String, Arc<QueueEntry>>>,
}

impl NamedQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` on the queue identified by `name`.
    ///
    /// Returns the operation's output. Operations under the same name
    /// never overlap and complete in the order they were submitted.
    pub async fn run<F, Fut, T>(&self, name: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let entry = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(QueueEntry {
                        lock: tokio::sync::Mutex::new(()),
                        pending: AtomicUsize::new(0),
                    })
                })
                .clone();
            entry.pending.fetch_add(1, Ordering::SeqCst);
            entry
        };

        let result = {
            let _guard = entry.lock.lock().await;
            op().await
        };

        if entry.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut entries = self.entries.lock().unwrap();
            // A new submission may have raced in and re-incremented, or
            // replaced the entry entirely; only drop our own drained one.
            if let Some(current) = entries.get(name) {
                if Arc::ptr_eq(current, &entry) && entry.pending.load(Ordering::SeqCst) == 0 {
                    entries.remove(name);
                }
            }
        }

        result
    }

    /// Number of names with pending or running operations.
    pub fn active_queues(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for NamedQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn runs_in_submission_order() {
        let queue = Arc::new(NamedQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = vec![];
        for i in 0..5 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue
                    .run("q", || {
                        let order = Arc::clone(&order);
                        async move {
                            // Delay inversely to submission index; without
                            // serialization later tasks would finish first.
                            sleep(Duration::from_millis(30 - 5 * i)).await;
                            order.lock().unwrap().push(i);
                        }
                    })
                    .await
            }));
            // Give each task time to enqueue before the next is spawned.
            sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn distinct_names_run_concurrently() {
        let queue = Arc::new(NamedQueue::new());
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for i in 0..3 {
            let queue = Arc::clone(&queue);
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                queue
                    .run(&format!("q-{i}"), || {
                        let started = Arc::clone(&started);
                        async move {
                            started.fetch_add(1, Ordering::SeqCst);
                            // Wait until all three have started; only
                            // possible if the queues do not serialize
                            // against each other.
                            while started.load(Ordering::SeqCst) < 3 {
                                sleep(Duration::from_millis(2)).await;
                            }
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn entry_destroyed_when_drained() {
        let queue = NamedQueue::new();
        queue.run("q", || async {}).await;
        assert_eq!(queue.active_queues(), 0);
    }

    #[tokio::test]
    async fn returns_operation_output() {
        let queue = NamedQueue::new();
        let out = queue.run("q", || async { 42 }).await;
        assert_eq!(out, 42);
    }
}
