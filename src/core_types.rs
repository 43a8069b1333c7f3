//! Core Types
//!
//! Identities, ids and the pending transfer record shared by every component.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of an account identity (an Ed25519 public key).
pub const IDENTITY_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is not valid hex: {0}")]
    NotHex(String),

    #[error("identity must be {IDENTITY_LEN} bytes, got {0}")]
    WrongLength(usize),
}

/// Account identity on the ledger.
///
/// Rendered and parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    pub const fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl TryFrom<&[u8]> for Identity {
    type Error = IdentityError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| IdentityError::WrongLength(bytes.len()))?;
        Ok(Self(arr))
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| IdentityError::NotHex(e.to_string()))?;
        Identity::try_from(bytes.as_slice())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Signing identity yielded by a wallet provider or supplied by the caller.
///
/// Cloning shares the key; `Debug` never prints key material.
#[derive(Clone)]
pub struct SigningHandle {
    key: Arc<SigningKey>,
}

impl SigningHandle {
    pub fn new(key: SigningKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Fresh random keypair.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn identity(&self) -> Identity {
        Identity(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

impl fmt::Debug for SigningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningHandle")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// How the caller names the source of a transfer.
///
/// Resolved once at admission: a bare identity is signed for later through the
/// wallet provider, a handle travels with the transfer.
#[derive(Debug, Clone)]
pub enum SourceRef {
    Identity(Identity),
    Handle(SigningHandle),
}

impl SourceRef {
    pub fn identity(&self) -> Identity {
        match self {
            SourceRef::Identity(id) => *id,
            SourceRef::Handle(handle) => handle.identity(),
        }
    }

    pub fn into_parts(self) -> (Identity, Option<SigningHandle>) {
        match self {
            SourceRef::Identity(id) => (id, None),
            SourceRef::Handle(handle) => (handle.identity(), Some(handle)),
        }
    }
}

impl From<Identity> for SourceRef {
    fn from(id: Identity) -> Self {
        SourceRef::Identity(id)
    }
}

impl From<SigningHandle> for SourceRef {
    fn from(handle: SigningHandle) -> Self {
        SourceRef::Handle(handle)
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            pub fn inner(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }
    };
}

ulid_id!(
    /// Unique id minted for each admitted transfer.
    TransferId
);

ulid_id!(
    /// Unique id of an executed bundle.
    BundleId
);

/// One admitted transfer intent waiting for a bundle.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub id: TransferId,
    pub source: Identity,
    pub destination: Identity,
    /// Base units, in `(0, max_amount]`.
    pub amount: u64,
    pub admitted_at: Instant,
    /// Recomputed by the optimizer until the transfer is selected.
    pub priority: f64,
    /// Present only when the caller handed over a signer at admission.
    pub signer: Option<SigningHandle>,
}

impl PendingTransfer {
    pub fn new(source: SourceRef, destination: Identity, amount: u64) -> Self {
        let (source, signer) = source.into_parts();
        Self {
            id: TransferId::new(),
            source,
            destination,
            amount,
            admitted_at: Instant::now(),
            priority: 0.0,
            signer,
        }
    }

    pub fn age_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.admitted_at).as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_hex_roundtrip() {
        let id = Identity::from_bytes([7u8; IDENTITY_LEN]);
        let parsed: Identity = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_identity_rejects_malformed() {
        assert!(matches!(
            "zz".parse::<Identity>(),
            Err(IdentityError::NotHex(_))
        ));
        assert_eq!(
            "abcd".parse::<Identity>(),
            Err(IdentityError::WrongLength(2))
        );
    }

    #[test]
    fn test_source_ref_parts() {
        let handle = SigningHandle::generate();
        let expected = handle.identity();
        let (id, signer) = SourceRef::from(handle).into_parts();
        assert_eq!(id, expected);
        assert!(signer.is_some());

        let (id, signer) = SourceRef::from(expected).into_parts();
        assert_eq!(id, expected);
        assert!(signer.is_none());
    }

    #[test]
    fn test_transfer_ids_unique() {
        let a = TransferId::new();
        let b = TransferId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<TransferId>().unwrap(), a);
    }

    #[test]
    fn test_signing_handle_debug_hides_key() {
        let handle = SigningHandle::generate();
        let dbg = format!("{:?}", handle);
        assert!(dbg.contains("SigningHandle"));
        assert!(!dbg.contains("key"));
    }
}
