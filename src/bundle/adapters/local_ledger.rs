//! In-memory ledger used by the demo binary and scenario tests.
//!
//! Applies each submission atomically: either every instruction moves funds or
//! none does. Accepted submissions are signed by the signer whose identity
//! matches the first instruction's `from`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use super::LedgerSubmitter;
use super::ed25519::encode_transaction;
use crate::bundle::error::SubmissionError;
use crate::bundle::types::{Confirmation, TransferInstruction};
use crate::core_types::{Identity, SigningHandle};

pub struct LocalLedger {
    balances: Mutex<FxHashMap<Identity, u64>>,
    latency: Option<Duration>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl LocalLedger {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(FxHashMap::default()),
            latency: None,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Simulated network round trip per submission.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn credit(&self, identity: Identity, amount: u64) {
        let mut balances = self.balances.lock();
        let entry = balances.entry(identity).or_insert(0);
        *entry = crate::safe_math::add(*entry, amount);
    }

    pub fn balance(&self, identity: &Identity) -> u64 {
        self.balances.lock().get(identity).copied().unwrap_or(0)
    }

    /// Sum of every balance.
    pub fn total_supply(&self) -> u128 {
        self.balances.lock().values().map(|v| *v as u128).sum()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn reject(&self, reason: impl Into<String>) -> SubmissionError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let err = SubmissionError::new(reason);
        warn!(reason = %err.reason, "Local ledger rejected submission");
        err
    }

    fn apply(&self, instructions: &[TransferInstruction]) -> Result<(), SubmissionError> {
        let mut balances = self.balances.lock();

        // Check the whole set before touching any balance.
        let mut debits: FxHashMap<Identity, u64> = FxHashMap::default();
        for ix in instructions {
            let from = match ix {
                TransferInstruction::Transfer { from, .. } | TransferInstruction::Fee { from, .. } => {
                    *from
                }
            };
            let total = debits.entry(from).or_insert(0);
            *total = total
                .checked_add(ix.amount())
                .ok_or_else(|| self.reject("debit overflow"))?;
        }
        for (from, total) in &debits {
            let available = balances.get(from).copied().unwrap_or(0);
            if available < *total {
                return Err(self.reject(format!(
                    "insufficient funds for {}: have {available}, need {total}",
                    from.short()
                )));
            }
        }

        for ix in instructions {
            let (from, to) = match ix {
                TransferInstruction::Transfer { from, to, .. } => (*from, *to),
                TransferInstruction::Fee { from, collector, .. } => (*from, *collector),
            };
            if let Some(balance) = balances.get_mut(&from) {
                *balance -= ix.amount();
            }
            let dest = balances.entry(to).or_insert(0);
            *dest = crate::safe_math::add(*dest, ix.amount());
        }
        Ok(())
    }
}

impl Default for LocalLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerSubmitter for LocalLedger {
    fn name(&self) -> &'static str {
        "local-ledger"
    }

    async fn submit(
        &self,
        instructions: &[TransferInstruction],
        signers: &[SigningHandle],
    ) -> Result<Confirmation, SubmissionError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let payer = match instructions.first() {
            Some(TransferInstruction::Transfer { from, .. })
            | Some(TransferInstruction::Fee { from, .. }) => *from,
            None => return Err(self.reject("empty instruction set")),
        };
        let signer = signers
            .iter()
            .find(|s| s.identity() == payer)
            .ok_or_else(|| self.reject(format!("missing signature for {}", payer.short())))?;

        let message =
            bincode::serialize(instructions).map_err(|e| self.reject(e.to_string()))?;

        self.apply(instructions)?;
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let signature = signer.sign(&message);
        debug!(
            payer = %payer.short(),
            instructions = instructions.len(),
            "Local ledger accepted submission"
        );
        Ok(Confirmation {
            signature: hex::encode(signature),
            transaction: encode_transaction(&payer, &signature, &message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::adapters::{Ed25519Verifier, SignatureVerifier};

    fn transfer(from: Identity, to: Identity, amount: u64) -> TransferInstruction {
        TransferInstruction::Transfer { from, to, amount }
    }

    #[tokio::test]
    async fn test_submit_moves_funds_and_verifies() {
        let ledger = LocalLedger::new();
        let alice = SigningHandle::generate();
        let bob = Identity::from_bytes([2; 32]);
        ledger.credit(alice.identity(), 100);

        let conf = ledger
            .submit(&[transfer(alice.identity(), bob, 40)], &[alice.clone()])
            .await
            .unwrap();

        assert_eq!(ledger.balance(&alice.identity()), 60);
        assert_eq!(ledger.balance(&bob), 40);
        assert_eq!(conf.signature.len(), 128);
        assert!(Ed25519Verifier.verify(&conf.transaction));
        assert_eq!(ledger.accepted(), 1);
    }

    #[tokio::test]
    async fn test_overdraft_rejected_atomically() {
        let ledger = LocalLedger::new();
        let alice = SigningHandle::generate();
        let bob = Identity::from_bytes([2; 32]);
        let fees = Identity::from_bytes([3; 32]);
        ledger.credit(alice.identity(), 100);

        let ix = vec![
            transfer(alice.identity(), bob, 95),
            TransferInstruction::Fee {
                from: alice.identity(),
                collector: fees,
                amount: 10,
            },
        ];
        assert!(ledger.submit(&ix, &[alice.clone()]).await.is_err());

        assert_eq!(ledger.balance(&alice.identity()), 100);
        assert_eq!(ledger.balance(&bob), 0);
        assert_eq!(ledger.balance(&fees), 0);
        assert_eq!(ledger.rejected(), 1);
    }

    #[tokio::test]
    async fn test_missing_signer_rejected() {
        let ledger = LocalLedger::new();
        let alice = SigningHandle::generate();
        let mallory = SigningHandle::generate();
        ledger.credit(alice.identity(), 100);

        let err = ledger
            .submit(
                &[transfer(alice.identity(), mallory.identity(), 1)],
                &[mallory],
            )
            .await
            .unwrap_err();
        assert!(err.reason.contains("missing signature"));
        assert_eq!(ledger.total_supply(), 100);
    }
}
