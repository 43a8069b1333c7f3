//! Transfer Bundling
//!
//! Collects individual transfer intents into a pending pool and executes them
//! in bundles against an external ledger.
//!
//! # Architecture
//!
//! ```text
//! add_transaction ─► throttle ─► guard(admit:src:dst) ─► optimizer + shards
//!                                                              │
//!                         early condition / timer ◄────────────┘
//!                                   │
//!                                   ▼
//!            guard(execute) ─► take top N ─► worker pool ─► executor
//!                                                             │
//!                         wallet ─► instructions ─► ledger ─► verifier
//! ```
//!
//! # Invariants
//!
//! 1. **Single admission**: a transfer id lives in the priority ordering and in
//!    exactly one shard until it is selected
//! 2. **Conservation**: selection removes exactly the selected members from every
//!    pending index
//! 3. **Single flight**: at most one bundle executes at a time
//! 4. **Member isolation**: a failed member never aborts or rolls back its siblings;
//!    the engine does not retry submissions

pub mod adapters;
pub mod engine;
pub mod error;
pub mod executor;
pub mod types;


// Re-exports for convenience
pub use adapters::{
    Ed25519Verifier, Keyring, LedgerSubmitter, LocalLedger, SignatureVerifier, WalletProvider,
};
pub use engine::{BundleEngine, EngineDeps};
pub use error::{EngineError, ErrorKind, SubmissionError, WalletError};
pub use executor::MemberExecutor;
pub use types::{
    AdmissionReceipt, Bundle, Confirmation, EngineStats, ExecutedBundleRecord, ExecutionOutcome,
    ExecutionSummary, MemberOutcome, NoOpReason, TransferInstruction,
};
