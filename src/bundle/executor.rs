//! Member Executor
//!
//! Runs one bundle member end to end: resolve signer, build instructions,
//! submit, verify. Every failure is captured in the member's own outcome so
//! siblings are never affected.

use std::sync::Arc;

use tracing::{debug, warn};

use super::adapters::{LedgerSubmitter, SignatureVerifier, WalletProvider};
use super::error::WalletError;
use super::types::{MemberOutcome, TransferInstruction};
use crate::cache::CacheManager;
use crate::config::BundleConfig;
use crate::core_types::{Identity, PendingTransfer, SigningHandle};
use crate::safe_math;

pub struct MemberExecutor {
    wallet: Arc<dyn WalletProvider>,
    submitter: Arc<dyn LedgerSubmitter>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    signers: Arc<CacheManager<Identity, SigningHandle>>,
    fee_percentage: f64,
    fee_collector: Option<Identity>,
    strict_verification: bool,
}

impl MemberExecutor {
    pub fn new(
        config: &BundleConfig,
        wallet: Arc<dyn WalletProvider>,
        submitter: Arc<dyn LedgerSubmitter>,
        verifier: Option<Arc<dyn SignatureVerifier>>,
        signers: Arc<CacheManager<Identity, SigningHandle>>,
    ) -> Self {
        Self {
            wallet,
            submitter,
            verifier,
            signers,
            fee_percentage: config.fee_percentage,
            fee_collector: config.fee_collector,
            strict_verification: config.strict_verification,
        }
    }

    /// Instruction set for one member. With a fee collector and a non-zero fee the
    /// amount is split into the net transfer and the fee.
    pub fn build_instructions(&self, transfer: &PendingTransfer) -> Vec<TransferInstruction> {
        let fee = match self.fee_collector {
            Some(_) if self.fee_percentage > 0.0 => {
                safe_math::percentage(transfer.amount, self.fee_percentage)
            }
            _ => 0,
        };
        let net = safe_math::subtract(transfer.amount, fee);

        let mut instructions = Vec::with_capacity(2);
        if net > 0 {
            instructions.push(TransferInstruction::Transfer {
                from: transfer.source,
                to: transfer.destination,
                amount: net,
            });
        }
        if let Some(collector) = self.fee_collector
            && fee > 0
        {
            instructions.push(TransferInstruction::Fee {
                from: transfer.source,
                collector,
                amount: fee,
            });
        }
        instructions
    }

    async fn resolve_signer(&self, transfer: &PendingTransfer) -> Result<SigningHandle, WalletError> {
        if let Some(handle) = &transfer.signer {
            return Ok(handle.clone());
        }
        if let Some(handle) = self.signers.get(&transfer.source) {
            return Ok(handle);
        }
        let handle = self.wallet.resolve_signer(&transfer.source).await?;
        self.signers.set(transfer.source, handle.clone(), None);
        Ok(handle)
    }

    pub async fn execute(&self, transfer: &PendingTransfer) -> MemberOutcome {
        let signer = match self.resolve_signer(transfer).await {
            Ok(signer) => signer,
            Err(e) => {
                warn!(
                    transfer_id = %transfer.id,
                    source = %transfer.source.short(),
                    wallet = self.wallet.name(),
                    error = %e,
                    "Signer resolution failed"
                );
                return MemberOutcome::Failed {
                    transfer_id: transfer.id,
                    reason: e.to_string(),
                };
            }
        };

        let instructions = self.build_instructions(transfer);
        let confirmation = match self.submitter.submit(&instructions, &[signer]).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                warn!(
                    transfer_id = %transfer.id,
                    amount = transfer.amount,
                    ledger = self.submitter.name(),
                    error = %e,
                    "Member submission failed"
                );
                return MemberOutcome::Failed {
                    transfer_id: transfer.id,
                    reason: e.to_string(),
                };
            }
        };

        let verified = self
            .verifier
            .as_ref()
            .map(|v| v.verify(&confirmation.transaction));
        if verified == Some(false) {
            warn!(
                transfer_id = %transfer.id,
                signature = %confirmation.signature,
                strict = self.strict_verification,
                "Signature verification failed"
            );
            if self.strict_verification {
                return MemberOutcome::Failed {
                    transfer_id: transfer.id,
                    reason: "signature verification failed".to_string(),
                };
            }
        }

        debug!(
            transfer_id = %transfer.id,
            amount = transfer.amount,
            signature = %confirmation.signature,
            "Member confirmed"
        );
        MemberOutcome::Confirmed {
            transfer_id: transfer.id,
            signature: confirmation.signature,
            verified,
        }
    }

    /// Inline path: members one after another, in order.
    pub async fn execute_serial(&self, members: &[PendingTransfer]) -> Vec<MemberOutcome> {
        let mut outcomes = Vec::with_capacity(members.len());
        for member in members {
            outcomes.push(self.execute(member).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::adapters::Ed25519Verifier;
    use crate::bundle::adapters::mock::{MockSubmitter, MockWallet};
    use crate::config::CacheConfig;
    use crate::core_types::SourceRef;

    struct Fixture {
        wallet: Arc<MockWallet>,
        submitter: Arc<MockSubmitter>,
        executor: MemberExecutor,
    }

    fn fixture(config: BundleConfig, verify: bool) -> Fixture {
        let wallet = Arc::new(MockWallet::new());
        let submitter = Arc::new(MockSubmitter::new());
        let verifier: Option<Arc<dyn SignatureVerifier>> = if verify {
            Some(Arc::new(Ed25519Verifier))
        } else {
            None
        };
        let executor = MemberExecutor::new(
            &config,
            wallet.clone(),
            submitter.clone(),
            verifier,
            Arc::new(CacheManager::new(&CacheConfig::default())),
        );
        Fixture {
            wallet,
            submitter,
            executor,
        }
    }

    fn dest() -> Identity {
        Identity::from_bytes([0xDD; 32])
    }

    #[test]
    fn test_instructions_without_fee() {
        let f = fixture(BundleConfig::default(), false);
        let t = PendingTransfer::new(SourceRef::Identity(Identity::from_bytes([1; 32])), dest(), 500);
        let ix = f.executor.build_instructions(&t);
        assert_eq!(ix.len(), 1);
        assert_eq!(ix[0].amount(), 500);
    }

    #[test]
    fn test_instructions_split_fee() {
        let collector = Identity::from_bytes([0xFE; 32]);
        let config = BundleConfig {
            fee_percentage: 1.0,
            fee_collector: Some(collector),
            ..BundleConfig::default()
        };
        let f = fixture(config, false);
        let source = Identity::from_bytes([1; 32]);
        let t = PendingTransfer::new(SourceRef::Identity(source), dest(), 1_000);

        let ix = f.executor.build_instructions(&t);
        assert_eq!(
            ix,
            vec![
                TransferInstruction::Transfer {
                    from: source,
                    to: dest(),
                    amount: 990
                },
                TransferInstruction::Fee {
                    from: source,
                    collector,
                    amount: 10
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_wallet_signer_is_cached() {
        let f = fixture(BundleConfig::default(), true);
        let source = f.wallet.add_signer();

        for _ in 0..3 {
            let t = PendingTransfer::new(SourceRef::Identity(source), dest(), 7);
            let outcome = f.executor.execute(&t).await;
            assert!(outcome.is_confirmed());
        }
        assert_eq!(f.wallet.lookups(), 1);
        assert_eq!(f.submitter.submit_count(), 3);
    }

    #[tokio::test]
    async fn test_caller_handle_skips_wallet() {
        let f = fixture(BundleConfig::default(), true);
        let t = PendingTransfer::new(SourceRef::Handle(SigningHandle::generate()), dest(), 7);

        match f.executor.execute(&t).await {
            MemberOutcome::Confirmed { verified, .. } => assert_eq!(verified, Some(true)),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.wallet.lookups(), 0);
    }

    #[tokio::test]
    async fn test_unknown_wallet_fails_member() {
        let f = fixture(BundleConfig::default(), false);
        let t = PendingTransfer::new(SourceRef::Identity(Identity::from_bytes([4; 32])), dest(), 7);

        match f.executor.execute(&t).await {
            MemberOutcome::Failed { reason, .. } => assert!(reason.contains("Wallet not found")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.submitter.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_verification_failure_is_lenient_by_default() {
        let f = fixture(BundleConfig::default(), true);
        f.submitter.set_corrupt_signatures(true);
        let t = PendingTransfer::new(SourceRef::Handle(SigningHandle::generate()), dest(), 7);

        match f.executor.execute(&t).await {
            MemberOutcome::Confirmed { verified, .. } => assert_eq!(verified, Some(false)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_strict_verification_fails_member() {
        let config = BundleConfig {
            strict_verification: true,
            ..BundleConfig::default()
        };
        let f = fixture(config, true);
        f.submitter.set_corrupt_signatures(true);
        let t = PendingTransfer::new(SourceRef::Handle(SigningHandle::generate()), dest(), 7);

        assert!(!f.executor.execute(&t).await.is_confirmed());
    }

    #[tokio::test]
    async fn test_serial_isolates_failures() {
        let f = fixture(BundleConfig::default(), false);
        f.submitter.fail_amount(2);
        let members: Vec<_> = (1..=3)
            .map(|amount| {
                PendingTransfer::new(SourceRef::Handle(SigningHandle::generate()), dest(), amount)
            })
            .collect();

        let outcomes = f.executor.execute_serial(&members).await;
        let confirmed: Vec<bool> = outcomes.iter().map(|o| o.is_confirmed()).collect();
        assert_eq!(confirmed, vec![true, false, true]);
        for (member, outcome) in members.iter().zip(&outcomes) {
            assert_eq!(member.id, outcome.transfer_id());
        }
    }
}
