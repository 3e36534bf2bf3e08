//! Per-key deduplication of concurrent loads.
//!
//! Concurrent callers asking for the same missing key share one underlying
//! fetch: the first caller leads and runs the load, the rest wait on the
//! leader's published result. The in-flight slot is released by a drop guard
//! so cancellation or a panicking loader never wedges a key.

use std::collections::HashMap;
use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}

/// Deduplicates concurrent loads per key.
pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Create an empty flight table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether no key is in flight.
    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }

    /// Run `load` for `key`, sharing the result with concurrent callers.
    ///
    /// At most one load runs per key for a given set of concurrent callers.
    /// If a leader is dropped before publishing (cancellation), one waiter
    /// takes over; in the pathological case where that leader vanishes too,
    /// the caller degrades to loading on its own.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send,
    {
        // Join an existing flight if one is up.
        let existing = self.inflight.lock().get(key).cloned();
        if let Some(rx) = existing {
            if let Some(value) = Self::wait(rx).await {
                return value;
            }
            // Leader vanished without publishing; contend for leadership.
        }

        let role = {
            let mut map = self.inflight.lock();
            match map.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.to_string(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let _slot = FlightSlot { flight: self, key };
                let value = load().await;
                let _ = tx.send(Some(value.clone()));
                value
            }
            Role::Follower(rx) => match Self::wait(rx).await {
                Some(value) => value,
                // Two leaders died under us; just do the work.
                None => load().await,
            },
        }
    }

    async fn wait(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
        loop {
            if let Some(value) = rx.borrow().clone() {
                return Some(value);
            }
            if rx.changed().await.is_err() {
                // Sender dropped; a value may still have been published.
                return rx.borrow().clone();
            }
        }
    }
}

/// Removes the in-flight slot when the leader finishes or is cancelled.
struct FlightSlot<'a, T: Clone> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
}

impl<T: Clone> Drop for FlightSlot<'_, T> {
    fn drop(&mut self) {
        self.flight.inflight.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_load() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let loads = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let flight = flight.clone();
            let loads = loads.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .run("k", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        7
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(flight.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let loads = Arc::new(AtomicU32::new(0));

        let a = {
            let flight = flight.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                flight
                    .run("a", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        1
                    })
                    .await
            })
        };
        let b = {
            let flight = flight.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                flight
                    .run("b", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        2
                    })
                    .await
            })
        };

        assert_eq!(a.await.unwrap(), 1);
        assert_eq!(b.await.unwrap(), 2);
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slot_released_after_error_result() {
        // The flight shares Result values; an Err must release the slot so
        // later callers retry.
        let flight = SingleFlight::<Result<u32, String>>::new();
        let first = flight.run("k", || async { Err::<u32, _>("boom".to_string()) }).await;
        assert!(first.is_err());
        assert!(flight.is_empty());

        let second = flight.run("k", || async { Ok::<_, String>(3) }).await;
        assert_eq!(second, Ok(3));
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_wedge_key() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("k", || async {
                        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        // Let the leader claim the slot, then kill it.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        leader.abort();
        let _ = leader.await;

        let value = flight.run("k", || async { 9 }).await;
        assert_eq!(value, 9);
        assert!(flight.is_empty());
    }
}
