use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::bundle::EngineError;
use crate::core_types::Identity;
use crate::shard::PartitionKey;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Emit the per-key lock audit trail (`guard` target) at debug level.
    #[serde(default)]
    pub guard_audit: bool,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "bundle_engine.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            guard_audit: false,
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config yaml: {}", config_path))?;
        config.engine.validate()?;
        Ok(config)
    }
}

/// Everything the bundle engine can be tuned with.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub bundle: BundleConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub shard: ShardConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let b = &self.bundle;
        if b.size == 0 {
            return Err(EngineError::Config("bundle.size must be > 0".into()));
        }
        if b.min_size == 0 || b.min_size > b.size {
            return Err(EngineError::Config(format!(
                "bundle.min_size must be in 1..={}, got {}",
                b.size, b.min_size
            )));
        }
        if b.max_amount == 0 {
            return Err(EngineError::Config("bundle.max_amount must be > 0".into()));
        }
        if !(0.0..=100.0).contains(&b.fee_percentage) {
            return Err(EngineError::Config(format!(
                "bundle.fee_percentage must be within [0, 100], got {}",
                b.fee_percentage
            )));
        }
        if !(0.0..=1.0).contains(&b.min_timeout_factor) || !(0.0..=1.0).contains(&b.early_fill_ratio)
        {
            return Err(EngineError::Config(
                "bundle ratios must be within [0, 1]".into(),
            ));
        }

        let w = &self.workers;
        if w.min_workers > w.resolved_max_workers() {
            return Err(EngineError::Config(format!(
                "workers.min_workers ({}) exceeds max_workers ({})",
                w.min_workers,
                w.resolved_max_workers()
            )));
        }
        if w.scale_down_threshold >= w.scale_up_threshold {
            return Err(EngineError::Config(
                "workers.scale_down_threshold must be below scale_up_threshold".into(),
            ));
        }
        if w.queue_capacity == 0 {
            return Err(EngineError::Config("workers.queue_capacity must be > 0".into()));
        }

        if self.shard.count == 0 {
            return Err(EngineError::Config("shard.count must be > 0".into()));
        }
        if self.cache.max_size == 0 {
            return Err(EngineError::Config("cache.max_size must be > 0".into()));
        }
        if self.throttle.max_requests_per_source == 0 || self.throttle.max_requests_per_second == 0
        {
            return Err(EngineError::Config("throttle limits must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BundleConfig {
    /// Most transfers per bundle.
    pub size: usize,
    /// High-priority count that triggers early execution.
    pub min_size: usize,
    pub timeout_ms: u64,
    /// Shrink the timeout as the pending pool fills.
    pub dynamic_timeout: bool,
    /// Floor of the dynamic timeout, as a fraction of `timeout_ms`.
    pub min_timeout_factor: f64,
    /// How strongly the pending ratio shortens the timeout.
    pub load_factor: f64,
    /// Pending fraction of `size` that triggers early execution.
    pub early_fill_ratio: f64,
    pub high_priority_threshold: f64,
    /// Largest single transfer, in base units.
    pub max_amount: u64,
    pub fee_percentage: f64,
    pub fee_collector: Option<Identity>,
    /// Treat a failed signature verification as a failed member.
    pub strict_verification: bool,
    /// Executed bundle records kept in memory.
    pub history_limit: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            size: 10,
            min_size: 3,
            timeout_ms: 5_000,
            dynamic_timeout: true,
            min_timeout_factor: 0.2,
            load_factor: 0.8,
            early_fill_ratio: 0.7,
            high_priority_threshold: 0.8,
            max_amount: 1_000_000_000_000,
            fee_percentage: 0.0,
            fee_collector: None,
            strict_verification: false,
            history_limit: 1_000,
        }
    }
}

impl BundleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Without a pool, bundles execute inline member by member.
    pub enabled: bool,
    pub min_workers: usize,
    /// 0 means the number of CPU cores.
    pub max_workers: usize,
    pub initial_workers: usize,
    /// Bounded queue depth per worker.
    pub queue_capacity: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub check_interval_ms: u64,
    pub cooldown_ms: u64,
    pub sample_window_ms: u64,
    /// CPU samples kept for the rolling average.
    pub history_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_workers: 1,
            max_workers: 0,
            initial_workers: 1,
            queue_capacity: 64,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            check_interval_ms: 5_000,
            cooldown_ms: 30_000,
            sample_window_ms: 100,
            history_len: 10,
        }
    }
}

impl WorkerConfig {
    /// Upper worker bound, never above the core count.
    pub fn resolved_max_workers(&self) -> usize {
        let cores = num_cpus::get().max(1);
        if self.max_workers == 0 {
            cores
        } else {
            self.max_workers.min(cores)
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.sample_window_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ShardConfig {
    pub count: usize,
    pub partition_key: PartitionKey,
    pub rebalance_interval_ms: u64,
    /// Relative distance from the mean load that flags a shard.
    pub imbalance_threshold: f64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            count: 4,
            partition_key: PartitionKey::Source,
            rebalance_interval_ms: 10_000,
            imbalance_threshold: 0.2,
        }
    }
}

impl ShardConfig {
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_size: usize,
    pub prune_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            max_size: 1_000,
            prune_interval_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_requests_per_second: usize,
    pub max_requests_per_source: usize,
    pub window_ms: u64,
    pub block_duration_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 1_000,
            max_requests_per_source: 100,
            window_ms: 60_000,
            block_duration_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PriorityConfig {
    pub amount_weight: f64,
    pub age_weight: f64,
    /// Amount at which the amount component saturates.
    pub amount_scale: u64,
    pub age_scale_ms: u64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            amount_weight: 0.7,
            age_weight: 0.3,
            amount_scale: 1_000_000,
            age_scale_ms: 10_000,
        }
    }
}
