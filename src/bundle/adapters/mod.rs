//! Collaborator Adapters
//!
//! The engine reaches the outside world only through these three traits:
//! - [`WalletProvider`] resolves a signing identity
//! - [`LedgerSubmitter`] takes a built instruction set and returns a confirmation
//! - [`SignatureVerifier`] checks the submitted transaction bytes
//!
//! Submitters MUST be safe to call again with the same instructions; the engine
//! never retries on its own, but callers may.

pub mod ed25519;
pub mod keyring;
pub mod local_ledger;

pub use ed25519::Ed25519Verifier;
pub use keyring::Keyring;
pub use local_ledger::LocalLedger;

use async_trait::async_trait;

use super::error::{SubmissionError, WalletError};
use super::types::{Confirmation, TransferInstruction};
use crate::core_types::{Identity, SigningHandle};

#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Get adapter name for logging
    fn name(&self) -> &'static str;

    async fn resolve_signer(&self, identity: &Identity) -> Result<SigningHandle, WalletError>;
}

#[async_trait]
pub trait LedgerSubmitter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(
        &self,
        instructions: &[TransferInstruction],
        signers: &[SigningHandle],
    ) -> Result<Confirmation, SubmissionError>;
}

pub trait SignatureVerifier: Send + Sync {
    /// False on any malformed input; never panics.
    fn verify(&self, transaction: &[u8]) -> bool;
}
