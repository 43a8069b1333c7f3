//! Bundle Engine - batched transfer execution
//!
//! Admits transfer intents, orders them by priority and executes them in
//! bundles on a bounded worker pool.
//!
//! # Modules
//!
//! - [`core_types`] - Identities, ids and the pending transfer record
//! - [`safe_math`] - Saturating integer arithmetic for amounts
//! - [`cache`] - TTL cache with LRU eviction
//! - [`throttle`] - Per-source and global request throttling
//! - [`shard`] - Hash partitioning of the pending pool
//! - [`optimizer`] - Priority scoring and ordering
//! - [`guard`] - Per-key async mutual exclusion
//! - [`autoscale`] - CPU-driven worker pool sizing
//! - [`workers`] - Bundle worker pool
//! - [`bundle`] - The orchestrator, its collaborators and error taxonomy
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing setup

// Core types - must be first!
pub mod core_types;

pub mod safe_math;

// Engine components
pub mod autoscale;
pub mod cache;
pub mod guard;
pub mod optimizer;
pub mod shard;
pub mod throttle;
pub mod workers;

pub mod bundle;

pub mod config;
pub mod logging;

// Convenient re-exports at crate root
pub use bundle::{
    AdmissionReceipt, BundleEngine, EngineDeps, EngineError, EngineStats, ExecutionOutcome,
};
pub use config::{AppConfig, EngineConfig};
pub use core_types::{BundleId, Identity, PendingTransfer, SigningHandle, SourceRef, TransferId};
