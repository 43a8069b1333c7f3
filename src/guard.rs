//! Per-key mutual exclusion for async operations.
//!
//! Each key owns a fair `tokio::sync::Mutex`: a caller that finds the key held is
//! parked in that mutex's FIFO wait list and runs, with the lock, strictly after
//! every earlier arrival. Distinct keys never contend.
//!
//! ```text
//!   Idle ──acquire──▶ Locked ──release──▶ Idle
//!                       │  ▲
//!            contended  ▼  │ hand-off (FIFO)
//!                     Queued
//! ```
//!
//! Every entry, queueing, exit and failure is logged under the `guard` target.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("guard key must not be empty")]
    EmptyKey,
}

#[derive(Default)]
struct KeyLock {
    mutex: Mutex<()>,
    queued: AtomicUsize,
}

/// Counts a parked caller until it is handed the lock or its future is dropped.
struct QueuedSlot<'a>(&'a AtomicUsize);

impl Drop for QueuedSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Drops the key's entry on the way out if nobody else holds it.
struct KeyCleanup<'a> {
    locks: &'a DashMap<String, Arc<KeyLock>>,
    key: &'a str,
}

impl Drop for KeyCleanup<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(self.key, |_, l| Arc::strong_count(l) == 1);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GuardStats {
    pub active_keys: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub contended: u64,
}

#[derive(Default)]
pub struct ReentrancyGuard {
    locks: DashMap<String, Arc<KeyLock>>,
    completed: AtomicU64,
    failed: AtomicU64,
    contended: AtomicU64,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` while holding the lock for `key`.
    ///
    /// Concurrent callers on the same key run one at a time, in arrival order.
    /// The lock is released whether `op` succeeds or fails.
    pub async fn execute_with_guard<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<GuardError> + fmt::Display,
    {
        if key.is_empty() {
            warn!(target: "guard", "guarded call without a key");
            return Err(GuardError::EmptyKey.into());
        }

        // Declared before `lock` so it runs after the Arc is released.
        let _cleanup = KeyCleanup {
            locks: &self.locks,
            key,
        };
        let lock = self
            .locks
            .entry(key.to_string())
            .or_default()
            .clone();

        let _held = match lock.mutex.try_lock() {
            Ok(held) => held,
            Err(_) => {
                let position = lock.queued.fetch_add(1, Ordering::AcqRel) + 1;
                let _slot = QueuedSlot(&lock.queued);
                self.contended.fetch_add(1, Ordering::Relaxed);
                debug!(target: "guard", key, position, "key busy, queued");
                lock.mutex.lock().await
            }
        };

        debug!(target: "guard", key, "entered");
        let started = Instant::now();
        let result = op().await;
        let elapsed_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(target: "guard", key, elapsed_us, "released");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target: "guard", key, elapsed_us, error = %e, "released after error");
            }
        }
        result
    }

    /// Whether some caller currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|l| l.mutex.try_lock().is_err())
    }

    pub fn stats(&self) -> GuardStats {
        let (active_keys, queued) = self
            .locks
            .iter()
            .fold((0, 0), |(keys, queued), l| {
                (keys + 1, queued + l.queued.load(Ordering::Acquire))
            });
        GuardStats {
            active_keys,
            queued,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_key_never_overlaps() {
        let guard = Arc::new(ReentrancyGuard::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let inside = Arc::new(AtomicBool::new(false));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let guard = guard.clone();
                let counter = counter.clone();
                let inside = inside.clone();
                tokio::spawn(async move {
                    guard
                        .execute_with_guard("k", || async {
                            assert!(!inside.swap(true, Ordering::SeqCst), "overlap detected");
                            let seen = counter.load(Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            counter.store(seen + 1, Ordering::SeqCst);
                            inside.store(false, Ordering::SeqCst);
                            Ok::<_, anyhow::Error>(())
                        })
                        .await
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(guard.stats().completed, 20);
        assert_eq!(guard.stats().active_keys, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_callers_run_in_arrival_order() {
        let guard = Arc::new(ReentrancyGuard::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        // Hold the key long enough for the others to queue behind it.
        let holder = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute_with_guard("k", || async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, anyhow::Error>(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let mut waiters = Vec::new();
        for i in 0..5 {
            let guard = guard.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                guard
                    .execute_with_guard("k", || async move {
                        order.lock().push(i);
                        Ok::<_, anyhow::Error>(())
                    })
                    .await
            }));
            // Stagger arrivals so the queue order is well defined.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        holder.await.unwrap().unwrap();
        for w in waiters {
            w.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(guard.stats().contended >= 5);
    }

    #[tokio::test]
    async fn test_error_releases_lock() {
        let guard = ReentrancyGuard::new();
        let failed: Result<(), anyhow::Error> = guard
            .execute_with_guard("k", || async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(failed.is_err());
        assert!(!guard.is_locked("k"));

        let ok: Result<u32, anyhow::Error> =
            guard.execute_with_guard("k", || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(guard.stats().failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_distinct_keys_run_concurrently() {
        let guard = Arc::new(ReentrancyGuard::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let g = guard.clone();
        let a = tokio::spawn(async move {
            g.execute_with_guard("a", || async move {
                // Completes only once "b" has run, which would deadlock if keys shared a lock.
                rx.await.map_err(anyhow::Error::from)
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(guard.is_locked("a"));
        guard
            .execute_with_guard("b", || async move {
                let _ = tx.send(());
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();

        a.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_waiter_leaves_no_trace() {
        let guard = Arc::new(ReentrancyGuard::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let holder = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .execute_with_guard("k", || async move {
                        let _ = started_tx.send(());
                        release_rx.await.map_err(anyhow::Error::from)
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let waiter = guard.execute_with_guard("k", || async { Ok::<_, anyhow::Error>(()) });
        assert!(tokio::time::timeout(Duration::from_millis(20), waiter).await.is_err());
        assert_eq!(guard.stats().queued, 0);
        assert_eq!(guard.stats().contended, 1);

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        let stats = guard.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.active_keys, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let guard = ReentrancyGuard::new();
        let result: Result<(), anyhow::Error> =
            guard.execute_with_guard("", || async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
