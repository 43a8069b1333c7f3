//! Ed25519 transaction envelope and verifier.
//!
//! Envelope layout:
//!
//! ```text
//! | signer (32) | signature (64) | message (..) |
//! ```

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::SignatureVerifier;
use crate::core_types::{IDENTITY_LEN, Identity};

const SIGNATURE_LEN: usize = 64;
const HEADER_LEN: usize = IDENTITY_LEN + SIGNATURE_LEN;

pub fn encode_transaction(signer: &Identity, signature: &[u8; 64], message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + message.len());
    out.extend_from_slice(signer.as_bytes());
    out.extend_from_slice(signature);
    out.extend_from_slice(message);
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    pub fn new() -> Self {
        Self
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, transaction: &[u8]) -> bool {
        if transaction.len() < HEADER_LEN {
            return false;
        }
        let (signer, rest) = transaction.split_at(IDENTITY_LEN);
        let (signature, message) = rest.split_at(SIGNATURE_LEN);

        let Ok(signer) = <[u8; IDENTITY_LEN]>::try_from(signer) else {
            return false;
        };
        let Ok(signature) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&signer) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&signature)).is_ok()
    }
}
