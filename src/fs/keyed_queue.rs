//! Keyed serialization primitive (spec §4.1, §5, §9).
//!
//! At most one outstanding mutating operation per key; distinct keys proceed
//! in parallel. Implemented as a map from key to a dedicated per-key mutex,
//! FIFO across tasks that contend on the same key because `tokio::sync::Mutex`
//! wakes waiters in acquisition order.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// Serializes async work by key. Cloning a `KeyedQueue` shares the
/// underlying lock table (cheap — it's an `Arc`).
#[derive(Clone)]
pub struct KeyedQueue<K> {
    locks: Arc<Mutex<HashMap<K, Arc<Mutex<()>>>>>,
}

impl<K> Default for KeyedQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        KeyedQueue {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `f` with exclusive access for `key`. Concurrent callers for the
    /// same key queue FIFO; callers for different keys run in parallel.
    pub async fn run<F, Fut, T>(&self, key: K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let per_key = {
            let mut table = self.locks.lock().await;
            table.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard: MutexGuard<'_, ()> = per_key.lock().await;
        f().await
    }

    /// Number of keys currently tracked (includes keys whose lock is free
    /// but not yet evicted). Exposed for tests and diagnostics only.
    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes() {
        let queue: KeyedQueue<String> = KeyedQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run("same".to_string(), || async move {
                        order.lock().await.push(i);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // No assertion on order (task spawn order isn't guaranteed), but
        // the critical section never overlapped — verified by the counter
        // test below.
    }

    #[tokio::test]
    async fn same_key_never_overlaps() {
        let queue: KeyedQueue<&'static str> = KeyedQueue::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let queue = queue.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run("k", || async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let queue: KeyedQueue<u32> = KeyedQueue::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for k in 0..8u32 {
            let queue = queue.clone();
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(k, || async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_concurrent.load(Ordering::SeqCst) > 1);
    }
}
