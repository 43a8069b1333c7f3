//! Bundle Engine
//!
//! Orchestrates admission, scheduling and execution of transfer bundles.
//!
//! # Pending pool lifecycle
//!
//! ```text
//!            add_transaction                 threshold reached
//! Accepting ───────────────► Accepting ──────────────────────────► Executing
//!     ▲                        │  arm deadline (dynamic timeout)      │
//!     │                        └──────────── timer fired ────────────►│
//!     └─────────────────── record + reschedule leftovers ◄────────────┘
//! ```
//!
//! One scheduler task watches the armed deadline. Arming, re-arming and
//! cancelling only change the deadline, so a cancelled timer never fires and an
//! execution already under way is never interrupted. Admission never executes a
//! bundle itself: a ready pool moves the deadline to now and the scheduler runs it.
//!
//! Each execution runs on its own task. Dropping the future returned by
//! [`BundleEngine::execute_bundle`] or closing the engine never cancels members
//! that were already selected; they always end up in an [`ExecutedBundleRecord`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::adapters::{LedgerSubmitter, SignatureVerifier, WalletProvider};
use super::error::EngineError;
use super::executor::MemberExecutor;
use super::types::{
    AdmissionReceipt, Bundle, EngineStats, ExecutedBundleRecord, ExecutionOutcome,
    ExecutionSummary, NoOpReason,
};
use crate::autoscale::{AutoScalingManager, CpuSampler, ProcStatSampler, WorkerScaler};
use crate::cache::CacheManager;
use crate::config::EngineConfig;
use crate::core_types::{Identity, PendingTransfer, SigningHandle, SourceRef};
use crate::guard::ReentrancyGuard;
use crate::optimizer::TransactionOptimizer;
use crate::shard::ShardManager;
use crate::throttle::ThrottlingManager;
use crate::workers::WorkerPool;

/// Guard key serialising bundle execution.
const EXECUTE_KEY: &str = "execute";

/// External collaborators injected at construction.
pub struct EngineDeps {
    pub wallet: Arc<dyn WalletProvider>,
    pub submitter: Arc<dyn LedgerSubmitter>,
    pub verifier: Option<Arc<dyn SignatureVerifier>>,
    /// Defaults to [`ProcStatSampler`].
    pub cpu_sampler: Option<Arc<dyn CpuSampler>>,
}

impl EngineDeps {
    pub fn new(wallet: Arc<dyn WalletProvider>, submitter: Arc<dyn LedgerSubmitter>) -> Self {
        Self {
            wallet,
            submitter,
            verifier: None,
            cpu_sampler: None,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_cpu_sampler(mut self, sampler: Arc<dyn CpuSampler>) -> Self {
        self.cpu_sampler = Some(sampler);
        self
    }
}

struct EngineInner {
    config: EngineConfig,
    pool: Mutex<TransactionOptimizer>,
    shards: Arc<ShardManager>,
    signers: Arc<CacheManager<Identity, SigningHandle>>,
    throttle: Arc<ThrottlingManager>,
    guard: ReentrancyGuard,
    scaling: Arc<AutoScalingManager>,
    workers: Option<Arc<WorkerPool>>,
    executor: Arc<MemberExecutor>,
    history: Mutex<VecDeque<ExecutedBundleRecord>>,
    deadline: watch::Sender<Option<Instant>>,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    executing: AtomicBool,
    closed: AtomicBool,
    executed_bundles: AtomicU64,
    executed_transfers: AtomicU64,
    failed_transfers: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the in-flight flag however the execution ends.
struct ExecutingFlag<'a>(&'a AtomicBool);

impl Drop for ExecutingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct BundleEngine {
    inner: Arc<EngineInner>,
}

impl BundleEngine {
    /// Build the engine and start its background tasks on the current tokio runtime.
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::Internal(format!("no tokio runtime: {e}")))?;

        let signers = Arc::new(CacheManager::new(&config.cache));
        let executor = Arc::new(MemberExecutor::new(
            &config.bundle,
            deps.wallet,
            deps.submitter,
            deps.verifier,
            Arc::clone(&signers),
        ));

        let workers = if config.workers.enabled {
            let initial = config
                .workers
                .initial_workers
                .max(config.workers.min_workers)
                .min(config.workers.resolved_max_workers());
            Some(Arc::new(WorkerPool::new(
                Arc::clone(&executor),
                initial,
                config.workers.queue_capacity,
            )))
        } else {
            None
        };

        let sampler = deps
            .cpu_sampler
            .unwrap_or_else(|| Arc::new(ProcStatSampler));
        let scaler = workers
            .as_ref()
            .map(|w| Arc::clone(w) as Arc<dyn WorkerScaler>);
        let scaling = Arc::new(AutoScalingManager::new(
            config.workers.clone(),
            sampler,
            scaler,
        ));

        let shards = Arc::new(ShardManager::new(config.shard.clone()));
        let throttle = Arc::new(ThrottlingManager::new(config.throttle.clone()));
        let (deadline, deadline_rx) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(EngineInner {
            pool: Mutex::new(TransactionOptimizer::new(config.priority.clone())),
            shards,
            signers,
            throttle,
            guard: ReentrancyGuard::new(),
            scaling,
            workers,
            executor,
            history: Mutex::new(VecDeque::new()),
            deadline,
            shutdown,
            scheduler: Mutex::new(None),
            executing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            executed_bundles: AtomicU64::new(0),
            executed_transfers: AtomicU64::new(0),
            failed_transfers: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        *inner.scheduler.lock() = Some(runtime.spawn(run_scheduler(
            Arc::downgrade(&inner),
            deadline_rx,
            shutdown_rx,
        )));
        let mut tasks = vec![
            inner.signers.spawn_pruner(inner.config.cache.prune_interval()),
            inner.throttle.spawn_cleanup(),
            inner.shards.spawn_rebalancer(),
        ];
        if inner.workers.is_some() {
            tasks.push(inner.scaling.spawn_controller());
        }
        *inner.tasks.lock() = tasks;

        info!(
            bundle_size = inner.config.bundle.size,
            timeout_ms = inner.config.bundle.timeout_ms,
            shards = inner.config.shard.count,
            workers = inner.workers.as_ref().map_or(0, |w| w.worker_count()),
            "Bundle engine started"
        );
        Ok(Self { inner })
    }

    /// Admit one transfer into the pending pool.
    ///
    /// `client_key` is the throttling key (caller address or API key); an empty
    /// key falls back to the source identity. When the admission makes the pool
    /// ready, execution is handed to the scheduler and this returns at once with
    /// `triggered_execution` set.
    pub async fn add_transaction(
        &self,
        source: impl Into<SourceRef>,
        destination: Identity,
        amount: u64,
        client_key: &str,
    ) -> Result<AdmissionReceipt, EngineError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }

        let source = source.into();
        let source_id = source.identity();
        let throttle_key = if client_key.is_empty() {
            source_id.to_hex()
        } else {
            client_key.to_string()
        };
        if let Err(reason) = inner.throttle.try_acquire(&throttle_key) {
            warn!(client = %throttle_key, reason = %reason, "Admission rate limited");
            return Err(reason.into());
        }

        let key = format!("admit:{}:{}", source_id, destination);
        let admitted = inner
            .guard
            .execute_with_guard(&key, || async move { inner.admit(source, destination, amount) })
            .await?;

        let mut receipt = AdmissionReceipt {
            id: admitted.transfer.id,
            priority: admitted.priority,
            shard: admitted.shard,
            pending_count: admitted.pending,
            estimated_execution_time: Utc::now(),
            triggered_execution: false,
        };

        if admitted.early {
            debug!(pending = admitted.pending, "Early execution condition met");
            inner.arm_now();
            receipt.triggered_execution = true;
        } else {
            let delay = inner.arm_if_idle(admitted.pending);
            receipt.estimated_execution_time = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        }
        Ok(receipt)
    }

    /// Execute one bundle of the highest-priority pending transfers.
    ///
    /// At most one bundle executes at a time; a call made while another is in
    /// flight returns `NoOp(InFlight)` and the running execution picks up any
    /// leftovers when it finishes. The execution runs on its own task, so a
    /// caller that stops waiting does not cancel it.
    pub async fn execute_bundle(&self) -> Result<ExecutionOutcome, EngineError> {
        let inner = Arc::clone(&self.inner);
        if inner.closed.load(Ordering::Acquire) {
            return Ok(ExecutionOutcome::NoOp(NoOpReason::Closed));
        }
        if inner.executing.load(Ordering::Acquire) {
            return Ok(ExecutionOutcome::NoOp(NoOpReason::InFlight));
        }
        tokio::spawn(async move {
            inner
                .guard
                .execute_with_guard(EXECUTE_KEY, || inner.run_bundle())
                .await
        })
        .await
        .map_err(|e| EngineError::Internal(format!("bundle execution task failed: {e}")))?
    }

    /// Execute bundles until nothing is pending or in flight. Returns how many
    /// this call ran.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let mut executed = 0;
        while self.pending_count() > 0 || self.inner.executing.load(Ordering::Acquire) {
            match self.execute_bundle().await? {
                ExecutionOutcome::Executed(_) => executed += 1,
                ExecutionOutcome::NoOp(NoOpReason::InFlight) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                ExecutionOutcome::NoOp(_) => break,
            }
        }
        Ok(executed)
    }

    /// Point-in-time snapshot; reads only.
    pub fn get_stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats {
            pending: self.pending_count(),
            executed_bundles: inner.executed_bundles.load(Ordering::Relaxed),
            executed_transfers: inner.executed_transfers.load(Ordering::Relaxed),
            failed_transfers: inner.failed_transfers.load(Ordering::Relaxed),
            executing: inner.executing.load(Ordering::Acquire),
            workers: inner.workers.as_ref().map_or(0, |w| w.worker_count()),
            next_execution_in_ms: inner.next_execution_in().map(|d| d.as_millis() as u64),
            closed: inner.closed.load(Ordering::Acquire),
            cache: inner.signers.stats(),
            throttle: inner.throttle.stats(),
            shards: inner.shards.stats(),
            scaling: inner.scaling.stats(),
            guard: inner.guard.stats(),
        }
    }

    /// Up to `n` most recent bundle records, oldest first.
    pub fn recent_bundles(&self, n: usize) -> Vec<ExecutedBundleRecord> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pool.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Cancel the timer, stop background tasks and workers. Idempotent.
    ///
    /// Transfers still pending are not executed. A bundle already executing
    /// runs to completion and is recorded; the worker pool is shut down once it
    /// finishes.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.disarm();
        inner.shutdown.send_replace(true);
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        if inner.executing.load(Ordering::SeqCst) {
            info!("Bundle in flight, workers stop after it completes");
        } else {
            inner.close_workers();
        }
        let pending = self.pending_count();
        if pending > 0 {
            warn!(pending, "Bundle engine closed with pending transfers");
        }
        info!("Bundle engine closed");
    }
}

struct Admitted {
    transfer: PendingTransfer,
    priority: f64,
    shard: usize,
    pending: usize,
    early: bool,
}

impl EngineInner {
    fn admit(
        &self,
        source: SourceRef,
        destination: Identity,
        amount: u64,
    ) -> Result<Admitted, EngineError> {
        if amount == 0 {
            return Err(EngineError::ZeroAmount);
        }
        let max = self.config.bundle.max_amount;
        if amount > max {
            return Err(EngineError::AmountTooLarge { amount, max });
        }
        if source.identity() == destination {
            return Err(EngineError::InvalidIdentity(
                "source and destination are the same".into(),
            ));
        }

        let transfer = PendingTransfer::new(source, destination, amount);
        let (priority, shard, pending, early) = {
            let mut pool = self.pool.lock();
            let shard = self.shards.assign_to_shard(&transfer);
            let priority = pool.add_transaction(transfer.clone());
            (priority, shard, pool.len(), self.early_execution_due(&pool))
        };

        debug!(
            transfer_id = %transfer.id,
            source = %transfer.source.short(),
            destination = %destination.short(),
            amount,
            priority,
            shard,
            pending,
            "Transfer admitted"
        );
        Ok(Admitted {
            transfer,
            priority,
            shard,
            pending,
            early,
        })
    }

    /// Pool fill at `early_fill_ratio` of a bundle, or enough high-priority members.
    fn early_execution_due(&self, pool: &TransactionOptimizer) -> bool {
        let cfg = &self.config.bundle;
        let pending = pool.len();
        pending > 0
            && (pending as f64 >= cfg.early_fill_ratio * cfg.size as f64
                || pool.count_above(cfg.high_priority_threshold) >= cfg.min_size)
    }

    /// `max(T * min_factor, T * (1 - pending/size * load_factor))`
    fn dynamic_timeout(&self, pending: usize) -> Duration {
        let cfg = &self.config.bundle;
        let base = cfg.timeout();
        if !cfg.dynamic_timeout {
            return base;
        }
        let ratio = pending as f64 / cfg.size as f64;
        let factor = (1.0 - ratio * cfg.load_factor)
            .max(cfg.min_timeout_factor)
            .clamp(0.0, 1.0);
        base.mul_f64(factor)
    }

    /// Arm the timer unless one is armed already; returns the time until it fires.
    fn arm_if_idle(&self, pending: usize) -> Duration {
        let delay = self.dynamic_timeout(pending);
        let mut remaining = delay;
        let armed = self.deadline.send_if_modified(|deadline| match deadline {
            Some(at) => {
                remaining = at.saturating_duration_since(Instant::now());
                false
            }
            None => {
                *deadline = Some(Instant::now() + delay);
                true
            }
        });
        if armed {
            debug!(delay_ms = delay.as_millis() as u64, pending, "Bundle timer armed");
        }
        remaining
    }

    /// Move the deadline to now, replacing any armed one.
    fn arm_now(&self) {
        self.deadline.send_replace(Some(Instant::now()));
    }

    fn disarm(&self) {
        self.deadline
            .send_if_modified(|deadline| deadline.take().is_some());
    }

    fn next_execution_in(&self) -> Option<Duration> {
        self.deadline
            .borrow()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    async fn run_bundle(&self) -> Result<ExecutionOutcome, EngineError> {
        let outcome = {
            if self
                .executing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(ExecutionOutcome::NoOp(NoOpReason::InFlight));
            }
            let _flag = ExecutingFlag(&self.executing);
            self.execute_selected().await
        };
        if self.closed.load(Ordering::SeqCst) {
            self.close_workers();
        } else {
            self.reschedule();
        }
        outcome
    }

    fn close_workers(&self) {
        if let Some(workers) = &self.workers {
            workers.close();
        }
    }

    async fn execute_selected(&self) -> Result<ExecutionOutcome, EngineError> {
        let members = {
            let mut pool = self.pool.lock();
            if pool.is_empty() {
                return Ok(ExecutionOutcome::NoOp(NoOpReason::Empty));
            }
            let members = pool.take_top(self.config.bundle.size);
            let ids: Vec<_> = members.iter().map(|m| m.id).collect();
            let removed = self.shards.remove_anywhere(&ids);
            if removed != ids.len() {
                error!(
                    selected = ids.len(),
                    removed, "Shard table out of sync with pending pool"
                );
            }
            members
        };
        self.disarm();

        let bundle = Bundle::new(members);
        info!(bundle_id = %bundle.id, count = bundle.len(), "Executing bundle");

        let (outcomes, distributed) = match &self.workers {
            Some(workers) if workers.worker_count() > 0 => {
                (workers.dispatch(bundle.members.clone()).await, true)
            }
            _ => (self.executor.execute_serial(&bundle.members).await, false),
        };
        if outcomes.len() != bundle.len() {
            return Err(EngineError::Internal(format!(
                "bundle {} produced {} outcomes for {} members",
                bundle.id,
                outcomes.len(),
                bundle.len()
            )));
        }

        let record = ExecutedBundleRecord::from_outcomes(&bundle, &outcomes, distributed);
        let summary = ExecutionSummary {
            bundle_id: bundle.id,
            count: bundle.len(),
            succeeded: record.members.len(),
            failed: record.failures.len(),
        };

        self.executed_bundles.fetch_add(1, Ordering::Relaxed);
        self.executed_transfers
            .fetch_add(summary.succeeded as u64, Ordering::Relaxed);
        self.failed_transfers
            .fetch_add(summary.failed as u64, Ordering::Relaxed);
        {
            let mut history = self.history.lock();
            history.push_back(record);
            while history.len() > self.config.bundle.history_limit {
                history.pop_front();
            }
        }

        info!(
            bundle_id = %summary.bundle_id,
            count = summary.count,
            succeeded = summary.succeeded,
            failed = summary.failed,
            distributed,
            "Bundle executed"
        );
        Ok(ExecutionOutcome::Executed(summary))
    }

    /// Schedule whatever is left after an execution.
    fn reschedule(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (pending, early) = {
            let pool = self.pool.lock();
            (pool.len(), self.early_execution_due(&pool))
        };
        if pending == 0 {
            return;
        }
        if early {
            self.arm_now();
        } else {
            self.arm_if_idle(pending);
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get_mut().take() {
            scheduler.abort();
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(workers) = &self.workers {
            workers.close();
        }
    }
}

/// Fires `execute_bundle` whenever the armed deadline passes, until shutdown.
///
/// Shutdown is only observed between executions.
async fn run_scheduler(
    inner: Weak<EngineInner>,
    mut deadline_rx: watch::Receiver<Option<Instant>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        let deadline = *deadline_rx.borrow_and_update();
        let fire = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = fire => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner
                    .deadline
                    .send_if_modified(|d| if *d == deadline { *d = None; true } else { false });
                debug!("Bundle timer fired");
                let engine = BundleEngine { inner };
                if let Err(e) = engine.execute_bundle().await {
                    error!(error = %e, code = e.code(), "Scheduled bundle execution failed");
                }
            }
        }
    }
}
