//! Bundle Worker Pool
//!
//! Each worker is a tokio task draining its own bounded queue. A bundle is cut
//! into contiguous chunks, one per worker, and the outcomes come back through a
//! oneshot per chunk so they can be stitched together in member order.
//!
//! ```text
//! dispatch ──chunk 0──► [queue 0] ─► worker 0 ──┐
//!          ──chunk 1──► [queue 1] ─► worker 1 ──┼─► outcomes (member order)
//!          ──chunk 2──► [queue 2] ─► worker 2 ──┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::autoscale::WorkerScaler;
use crate::bundle::executor::MemberExecutor;
use crate::bundle::types::MemberOutcome;
use crate::core_types::PendingTransfer;

struct Job {
    members: Vec<PendingTransfer>,
    reply: oneshot::Sender<Vec<MemberOutcome>>,
}

struct WorkerHandle {
    id: usize,
    tx: mpsc::Sender<Job>,
    task: JoinHandle<()>,
}

pub struct WorkerPool {
    executor: Arc<MemberExecutor>,
    queue_capacity: usize,
    workers: Mutex<Vec<WorkerHandle>>,
    next_id: AtomicUsize,
    chunks_dispatched: AtomicU64,
    chunks_inline: AtomicU64,
    closed: AtomicBool,
}

/// Split into `parts` contiguous runs whose lengths differ by at most one.
/// Leading runs take the remainder.
pub fn partition<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let parts = parts.clamp(1, items.len());
    let base = items.len() / parts;
    let extra = items.len() % parts;

    let mut out = Vec::with_capacity(parts);
    let mut iter = items.into_iter();
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        out.push(iter.by_ref().take(len).collect());
    }
    out
}

impl WorkerPool {
    /// Starts `initial_workers` workers on the current runtime.
    pub fn new(executor: Arc<MemberExecutor>, initial_workers: usize, queue_capacity: usize) -> Self {
        let pool = Self {
            executor,
            queue_capacity: queue_capacity.max(1),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            chunks_dispatched: AtomicU64::new(0),
            chunks_inline: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        pool.resize(initial_workers);
        pool
    }

    fn spawn_worker(&self) -> Option<WorkerHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, cannot start bundle worker");
            return None;
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Job>(self.queue_capacity);
        let executor = Arc::clone(&self.executor);

        let task = runtime.spawn(async move {
            debug!(worker = id, "Bundle worker started");
            while let Some(job) = rx.recv().await {
                let count = job.members.len();
                let outcomes = executor.execute_serial(&job.members).await;
                if job.reply.send(outcomes).is_err() {
                    warn!(worker = id, count, "Dispatcher went away before chunk completed");
                }
            }
            debug!(worker = id, "Bundle worker stopped");
        });
        Some(WorkerHandle { id, tx, task })
    }

    fn resize(&self, target: usize) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let mut workers = self.workers.lock();
        while workers.len() < target {
            match self.spawn_worker() {
                Some(worker) => workers.push(worker),
                None => break,
            }
        }
        while workers.len() > target {
            // Dropping the sender lets the worker finish its queue and exit.
            if let Some(worker) = workers.pop() {
                debug!(worker = worker.id, "Retiring bundle worker");
            }
        }
        workers.len()
    }

    /// Execute members across the pool, returning outcomes in member order.
    ///
    /// With no workers the members run inline.
    pub async fn dispatch(&self, members: Vec<PendingTransfer>) -> Vec<MemberOutcome> {
        let senders: Vec<(usize, mpsc::Sender<Job>)> = {
            let workers = self.workers.lock();
            workers.iter().map(|w| (w.id, w.tx.clone())).collect()
        };
        if senders.is_empty() || self.closed.load(Ordering::Acquire) {
            self.chunks_inline.fetch_add(1, Ordering::Relaxed);
            return self.executor.execute_serial(&members).await;
        }

        let chunks = partition(members, senders.len());
        let tasks = chunks
            .into_iter()
            .zip(senders)
            .map(|(chunk, (worker, tx))| self.run_chunk(worker, tx, chunk));
        join_all(tasks).await.into_iter().flatten().collect()
    }

    async fn run_chunk(
        &self,
        worker: usize,
        tx: mpsc::Sender<Job>,
        members: Vec<PendingTransfer>,
    ) -> Vec<MemberOutcome> {
        let ids: Vec<_> = members.iter().map(|m| m.id).collect();
        let (reply, rx) = oneshot::channel();

        if let Err(mpsc::error::SendError(job)) = tx.send(Job { members, reply }).await {
            warn!(worker, count = job.members.len(), "Worker queue closed, running chunk inline");
            self.chunks_inline.fetch_add(1, Ordering::Relaxed);
            return self.executor.execute_serial(&job.members).await;
        }
        self.chunks_dispatched.fetch_add(1, Ordering::Relaxed);

        match rx.await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                // Members may already be on the ledger; never resubmit them here.
                warn!(worker, count = ids.len(), "Worker terminated mid-chunk");
                ids.into_iter()
                    .map(|transfer_id| MemberOutcome::Failed {
                        transfer_id,
                        reason: "worker terminated".to_string(),
                    })
                    .collect()
            }
        }
    }

    pub fn chunks_dispatched(&self) -> u64 {
        self.chunks_dispatched.load(Ordering::Relaxed)
    }

    pub fn chunks_inline(&self) -> u64 {
        self.chunks_inline.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every worker. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for worker in workers {
            worker.task.abort();
        }
        info!(workers = count, "Worker pool closed");
    }
}

impl WorkerScaler for WorkerPool {
    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn scale_workers(&self, target: usize) -> usize {
        self.resize(target)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().drain(..) {
            worker.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::adapters::mock::{MockSubmitter, MockWallet};
    use crate::cache::CacheManager;
    use crate::config::{BundleConfig, CacheConfig};
    use crate::core_types::{Identity, SigningHandle, SourceRef};
    use std::time::Duration;

    fn executor(submitter: Arc<MockSubmitter>) -> Arc<MemberExecutor> {
        Arc::new(MemberExecutor::new(
            &BundleConfig::default(),
            Arc::new(MockWallet::new()),
            submitter,
            None,
            Arc::new(CacheManager::new(&CacheConfig::default())),
        ))
    }

    fn members(n: u64) -> Vec<PendingTransfer> {
        (1..=n)
            .map(|amount| {
                PendingTransfer::new(
                    SourceRef::Handle(SigningHandle::generate()),
                    Identity::from_bytes([0xAB; 32]),
                    amount,
                )
            })
            .collect()
    }

    #[test]
    fn test_partition_sizes() {
        let sizes = |n: usize, parts: usize| -> Vec<usize> {
            partition((0..n).collect::<Vec<_>>(), parts)
                .iter()
                .map(Vec::len)
                .collect()
        };
        assert_eq!(sizes(10, 3), vec![4, 3, 3]);
        assert_eq!(sizes(2, 4), vec![1, 1]);
        assert_eq!(sizes(5, 0), vec![5]);
        assert!(sizes(0, 3).is_empty());

        let chunks = partition((0..7).collect::<Vec<_>>(), 2);
        assert_eq!(chunks, vec![vec![0, 1, 2, 3], vec![4, 5, 6]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dispatch_preserves_member_order() {
        let submitter = Arc::new(MockSubmitter::new());
        let pool = WorkerPool::new(executor(submitter.clone()), 3, 8);
        let batch = members(10);
        let expected: Vec<_> = batch.iter().map(|m| m.id).collect();

        let outcomes = pool.dispatch(batch).await;

        let got: Vec<_> = outcomes.iter().map(|o| o.transfer_id()).collect();
        assert_eq!(got, expected);
        assert!(outcomes.iter().all(|o| o.is_confirmed()));
        assert_eq!(pool.chunks_dispatched(), 3);
        assert_eq!(submitter.submit_count(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_run_in_parallel() {
        let submitter = Arc::new(MockSubmitter::new());
        submitter.set_delay(Duration::from_millis(50));
        let pool = WorkerPool::new(executor(submitter.clone()), 4, 8);

        pool.dispatch(members(8)).await;

        assert!(submitter.max_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let pool = WorkerPool::new(executor(Arc::new(MockSubmitter::new())), 1, 4);
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.scale_workers(3), 3);
        assert_eq!(pool.scale_workers(2), 2);
        assert_eq!(pool.worker_count(), 2);

        let outcomes = pool.dispatch(members(5)).await;
        assert_eq!(outcomes.len(), 5);
    }

    #[tokio::test]
    async fn test_no_workers_runs_inline() {
        let submitter = Arc::new(MockSubmitter::new());
        let pool = WorkerPool::new(executor(submitter.clone()), 0, 4);

        let outcomes = pool.dispatch(members(3)).await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(pool.chunks_inline(), 1);
        assert_eq!(pool.chunks_dispatched(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let submitter = Arc::new(MockSubmitter::new());
        let pool = WorkerPool::new(executor(submitter.clone()), 2, 4);
        pool.close();
        pool.close();

        assert!(pool.is_closed());
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(pool.scale_workers(4), 0);
        // Still usable inline after close.
        assert_eq!(pool.dispatch(members(2)).await.len(), 2);
    }
}
