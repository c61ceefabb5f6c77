//! Single-flight execution for concurrent async operations.
//!
//! [`Dedup`] collapses concurrent invocations that share an id into one
//! execution of the underlying operation. The first caller becomes the
//! leader and runs the operation; every caller that arrives while it is
//! still running waits and receives a clone of the leader's result,
//! success or failure alike.
//!
//! Ids must be equivalence-stable: two invocations that could produce
//! different results must never share an id.
//!
//! # Cancellation
//!
//! If the leader future is dropped before completion, followers keep
//! waiting. Leaders are expected to run to completion; put timeouts on
//! the caller side if that cannot be guaranteed.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OnceCell};

/// Shared slot for one in-flight operation.
struct Flight<V, E> {
    /// Set exactly once, by the leader.
    result: OnceCell<Result<V, E>>,
    /// Wakes followers once the result is in place.
    notify: Notify,
}

/// Collapses concurrent operations with equal ids into a single execution.
pub struct Dedup<K, V, E> {
    in_flight: Mutex<HashMap<K, Arc<Flight<V, E>>>>,
}

impl<K, V, E> Dedup<K, V, E>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
    E: Clone + Send,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` under single-flight semantics for `id`.
    ///
    /// If no operation with this id is currently running, `op` is invoked
    /// and its result returned. Otherwise this call waits for the running
    /// operation and returns a clone of its result.
    pub async fn run<F, Fut>(&self, id: K, op: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (flight, leader) = {
            let mut map = self.in_flight.lock().unwrap();
            match map.get(&id) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        result: OnceCell::new(),
                        notify: Notify::new(),
                    });
                    map.insert(id.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if leader {
            let result = op().await;
            // We are the only writer for this flight.
            let _ = flight.result.set(result.clone());
            flight.notify.notify_waiters();
            self.in_flight.lock().unwrap().remove(&id);
            result
        } else {
            loop {
                // Register before checking, so a notify between the check
                // and the await cannot be lost.
                let notified = flight.notify.notified();
                if let Some(result) = flight.result.get() {
                    return result.clone();
                }
                notified.await;
            }
        }
    }

    /// Number of distinct ids currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

impl<K, V, E> Default for Dedup<K, V, E>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
    E: Clone + Send,
{
    fn default() -> Self {
        Self::new()
    }
}
