//! In-process wallet provider.
//!
//! Holds signing keys by identity. A locked entry still exists but refuses to
//! sign, which surfaces as `AuthenticationFailed`.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::WalletProvider;
use crate::bundle::error::WalletError;
use crate::core_types::{Identity, SigningHandle};

struct KeyEntry {
    handle: SigningHandle,
    label: Option<String>,
    locked: bool,
}

#[derive(Default)]
pub struct Keyring {
    keys: DashMap<Identity, KeyEntry>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and store a fresh keypair.
    pub fn generate(&self, label: Option<&str>) -> SigningHandle {
        let handle = SigningHandle::generate();
        self.insert(handle.clone(), label);
        handle
    }

    pub fn insert(&self, handle: SigningHandle, label: Option<&str>) -> Identity {
        let id = handle.identity();
        self.keys.insert(
            id,
            KeyEntry {
                handle,
                label: label.map(str::to_owned),
                locked: false,
            },
        );
        id
    }

    /// Returns false if the identity is unknown.
    pub fn set_locked(&self, identity: &Identity, locked: bool) -> bool {
        match self.keys.get_mut(identity) {
            Some(mut entry) => {
                entry.locked = locked;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, identity: &Identity) -> bool {
        self.keys.remove(identity).is_some()
    }

    pub fn label(&self, identity: &Identity) -> Option<String> {
        self.keys.get(identity).and_then(|e| e.label.clone())
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.keys.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl WalletProvider for Keyring {
    fn name(&self) -> &'static str {
        "keyring"
    }

    async fn resolve_signer(&self, identity: &Identity) -> Result<SigningHandle, WalletError> {
        let entry = self
            .keys
            .get(identity)
            .ok_or(WalletError::WalletNotFound(*identity))?;
        if entry.locked {
            debug!(identity = %identity.short(), "Keyring entry is locked");
            return Err(WalletError::AuthenticationFailed(*identity));
        }
        Ok(entry.handle.clone())
    }
}
