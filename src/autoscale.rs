//! Feedback controller for the worker pool size.
//!
//! Each tick samples CPU utilisation over a short window and folds it into a
//! bounded rolling history. Once the cooldown since the last scaling action has
//! passed, the rolling average decides one step:
//!
//! | average                  | workers         | action      |
//! |--------------------------|-----------------|-------------|
//! | `> scale_up_threshold`   | `< max_workers` | +1          |
//! | `< scale_down_threshold` | `> min_workers` | -1          |
//! | otherwise                |                 | hold        |

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::WorkerConfig;

/// Source of CPU utilisation samples, as a ratio in `[0, 1]`.
#[async_trait]
pub trait CpuSampler: Send + Sync {
    /// Utilisation measured across `window`; `None` when unavailable.
    async fn sample(&self, window: Duration) -> Option<f64>;
}

/// Whatever owns the workers being scaled.
pub trait WorkerScaler: Send + Sync {
    fn worker_count(&self) -> usize;

    /// Resize to exactly `target` workers; a no-op when already there.
    fn scale_workers(&self, target: usize) -> usize;
}

/// Reads aggregate CPU time from `/proc/stat` (Linux).
#[derive(Debug, Default)]
pub struct ProcStatSampler;

impl ProcStatSampler {
    async fn read_times() -> Option<(u64, u64)> {
        let stat = tokio::fs::read_to_string("/proc/stat").await.ok()?;
        parse_cpu_line(stat.lines().next()?)
    }
}

/// `(busy, total)` jiffies from the aggregate `cpu` line.
fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total - idle, total))
}

#[async_trait]
impl CpuSampler for ProcStatSampler {
    async fn sample(&self, window: Duration) -> Option<f64> {
        let (busy0, total0) = Self::read_times().await?;
        tokio::time::sleep(window).await;
        let (busy1, total1) = Self::read_times().await?;
        let total = total1.saturating_sub(total0);
        if total == 0 {
            return Some(0.0);
        }
        Some((busy1.saturating_sub(busy0) as f64 / total as f64).clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ScalingDecision {
    Hold,
    CoolingDown,
    /// Nothing to scale (no worker pool).
    Disabled,
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
}

#[derive(Debug, Default)]
struct ScalingState {
    history: VecDeque<f64>,
    last_action: Option<Instant>,
    scale_ups: u64,
    scale_downs: u64,
    last_decision: Option<ScalingDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingStats {
    pub workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub average_cpu: Option<f64>,
    pub samples: usize,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub last_decision: Option<ScalingDecision>,
}

pub struct AutoScalingManager {
    config: WorkerConfig,
    max_workers: usize,
    sampler: Arc<dyn CpuSampler>,
    scaler: Option<Arc<dyn WorkerScaler>>,
    state: Mutex<ScalingState>,
}

impl AutoScalingManager {
    pub fn new(
        config: WorkerConfig,
        sampler: Arc<dyn CpuSampler>,
        scaler: Option<Arc<dyn WorkerScaler>>,
    ) -> Self {
        let max_workers = config.resolved_max_workers();
        Self {
            config,
            max_workers,
            sampler,
            scaler,
            state: Mutex::new(ScalingState::default()),
        }
    }

    /// Current utilisation over the configured sample window; 0 when unavailable.
    pub async fn get_cpu_usage(&self) -> f64 {
        match self.sampler.sample(self.config.sample_window()).await {
            Some(ratio) => ratio,
            None => {
                debug!("cpu usage unavailable, reporting 0");
                0.0
            }
        }
    }

    /// One controller tick: sample, then decide at most one ±1 step.
    pub async fn check_scaling(&self) -> ScalingDecision {
        let Some(scaler) = self.scaler.clone() else {
            return ScalingDecision::Disabled;
        };

        let sample = self.sampler.sample(self.config.sample_window()).await;

        let decision = {
            let mut state = self.state.lock();
            if let Some(ratio) = sample {
                state.history.push_back(ratio);
                while state.history.len() > self.config.history_len.max(1) {
                    state.history.pop_front();
                }
            }

            let cooling = state
                .last_action
                .is_some_and(|at| at.elapsed() < self.config.cooldown());
            let decision = if cooling {
                ScalingDecision::CoolingDown
            } else {
                match average(&state.history) {
                    None => ScalingDecision::Hold,
                    Some(avg) => {
                        let current = scaler.worker_count();
                        if avg > self.config.scale_up_threshold && current < self.max_workers {
                            ScalingDecision::ScaleUp {
                                from: current,
                                to: current + 1,
                            }
                        } else if avg < self.config.scale_down_threshold
                            && current > self.config.min_workers
                        {
                            ScalingDecision::ScaleDown {
                                from: current,
                                to: current - 1,
                            }
                        } else {
                            ScalingDecision::Hold
                        }
                    }
                }
            };

            match decision {
                ScalingDecision::ScaleUp { .. } => {
                    state.scale_ups += 1;
                    state.last_action = Some(Instant::now());
                }
                ScalingDecision::ScaleDown { .. } => {
                    state.scale_downs += 1;
                    state.last_action = Some(Instant::now());
                }
                _ => {}
            }
            state.last_decision = Some(decision);
            decision
        };

        match decision {
            ScalingDecision::ScaleUp { from, to } | ScalingDecision::ScaleDown { from, to } => {
                scaler.scale_workers(to);
                info!(from, to, "worker pool rescaled");
            }
            _ => {}
        }
        decision
    }

    /// Resize the pool directly, clamped into `[min_workers, max_workers]`.
    pub fn scale_workers(&self, target: usize) -> usize {
        let Some(scaler) = &self.scaler else {
            return 0;
        };
        let target = target.max(self.config.min_workers).min(self.max_workers);
        if scaler.worker_count() == target {
            return target;
        }
        scaler.scale_workers(target)
    }

    pub fn stats(&self) -> ScalingStats {
        let state = self.state.lock();
        ScalingStats {
            workers: self.scaler.as_ref().map_or(0, |s| s.worker_count()),
            min_workers: self.config.min_workers,
            max_workers: self.max_workers,
            average_cpu: average(&state.history),
            samples: state.history.len(),
            scale_ups: state.scale_ups,
            scale_downs: state.scale_downs,
            last_decision: state.last_decision,
        }
    }

    /// Periodic controller loop. Abort the handle to stop it.
    pub fn spawn_controller(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = self.config.check_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let decision = manager.check_scaling().await;
                debug!(?decision, "scaling check");
            }
        })
    }
}

fn average(history: &VecDeque<f64>) -> Option<f64> {
    if history.is_empty() {
        None
    } else {
        Some(history.iter().sum::<f64>() / history.len() as f64)
    }
}
