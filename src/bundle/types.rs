//! Bundle Types
//!
//! Bundles, per-member outcomes, receipts and the stats snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::autoscale::ScalingStats;
use crate::cache::CacheStats;
use crate::core_types::{BundleId, Identity, PendingTransfer, TransferId};
use crate::guard::GuardStats;
use crate::shard::ShardStats;
use crate::throttle::ThrottleStats;

/// One ledger instruction built for a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferInstruction {
    Transfer {
        from: Identity,
        to: Identity,
        amount: u64,
    },
    Fee {
        from: Identity,
        collector: Identity,
        amount: u64,
    },
}

impl TransferInstruction {
    pub fn amount(&self) -> u64 {
        match self {
            TransferInstruction::Transfer { amount, .. } | TransferInstruction::Fee { amount, .. } => {
                *amount
            }
        }
    }
}

/// What the ledger hands back for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    /// Transaction signature, hex.
    pub signature: String,
    /// The exact bytes submitted, as accepted by a signature verifier.
    #[serde(skip)]
    pub transaction: Vec<u8>,
}

/// A set of transfers executed together.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    /// Priority order at selection time.
    pub members: Vec<PendingTransfer>,
    pub created_at: DateTime<Utc>,
}

impl Bundle {
    pub fn new(members: Vec<PendingTransfer>) -> Self {
        Self {
            id: BundleId::new(),
            members,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Result of executing one member of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MemberOutcome {
    Confirmed {
        transfer_id: TransferId,
        signature: String,
        /// `None` when no verifier is configured.
        verified: Option<bool>,
    },
    Failed {
        transfer_id: TransferId,
        reason: String,
    },
}

impl MemberOutcome {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            MemberOutcome::Confirmed { transfer_id, .. }
            | MemberOutcome::Failed { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MemberOutcome::Confirmed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutedMember {
    pub transfer_id: TransferId,
    pub source: Identity,
    pub destination: Identity,
    pub amount: u64,
    pub signature: String,
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMember {
    pub transfer_id: TransferId,
    pub reason: String,
}

/// Log entry for a completed bundle. Failed members are listed apart from the executed ones.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedBundleRecord {
    pub bundle_id: BundleId,
    pub created_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
    pub members: Vec<ExecutedMember>,
    pub failures: Vec<FailedMember>,
    /// Whether the bundle ran on the worker pool or inline.
    pub distributed: bool,
}

impl ExecutedBundleRecord {
    pub fn from_outcomes(bundle: &Bundle, outcomes: &[MemberOutcome], distributed: bool) -> Self {
        let mut members = Vec::new();
        let mut failures = Vec::new();
        for (transfer, outcome) in bundle.members.iter().zip(outcomes) {
            match outcome {
                MemberOutcome::Confirmed {
                    signature,
                    verified,
                    ..
                } => members.push(ExecutedMember {
                    transfer_id: transfer.id,
                    source: transfer.source,
                    destination: transfer.destination,
                    amount: transfer.amount,
                    signature: signature.clone(),
                    verified: *verified,
                }),
                MemberOutcome::Failed { reason, .. } => failures.push(FailedMember {
                    transfer_id: transfer.id,
                    reason: reason.clone(),
                }),
            }
        }
        Self {
            bundle_id: bundle.id,
            created_at: bundle.created_at,
            executed_at: Utc::now(),
            members,
            failures,
            distributed,
        }
    }
}

/// Returned to the caller of `add_transaction`.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReceipt {
    pub id: TransferId,
    pub priority: f64,
    pub shard: usize,
    /// Pending count right after admission.
    pub pending_count: usize,
    /// When this admission's bundle is expected to run.
    pub estimated_execution_time: DateTime<Utc>,
    /// Admission satisfied the early-execution condition; the scheduler runs
    /// the bundle without waiting for the timer.
    pub triggered_execution: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub bundle_id: BundleId,
    pub count: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoOpReason {
    Empty,
    InFlight,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub enum ExecutionOutcome {
    Executed(ExecutionSummary),
    NoOp(NoOpReason),
}

impl ExecutionOutcome {
    pub fn summary(&self) -> Option<&ExecutionSummary> {
        match self {
            ExecutionOutcome::Executed(summary) => Some(summary),
            ExecutionOutcome::NoOp(_) => None,
        }
    }
}

/// Point-in-time view of the engine and its components.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pending: usize,
    pub executed_bundles: u64,
    pub executed_transfers: u64,
    pub failed_transfers: u64,
    pub executing: bool,
    pub workers: usize,
    /// Milliseconds until the armed bundle timer fires.
    pub next_execution_in_ms: Option<u64>,
    pub closed: bool,
    pub cache: CacheStats,
    pub throttle: ThrottleStats,
    pub shards: ShardStats,
    pub scaling: ScalingStats,
    pub guard: GuardStats,
}
