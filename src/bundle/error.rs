//! Bundle Engine Error Types
//!
//! One enum for every failure a caller of the engine can observe, grouped into
//! the kinds callers act on: validation and rate-limit errors are returned at
//! admission, submission errors are recorded per member, internal errors are
//! programming faults.

use thiserror::Error;

use crate::core_types::{Identity, IdentityError};
use crate::guard::GuardError;
use crate::throttle::RateLimitReason;

/// Broad class of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    RateLimit,
    Submission,
    Internal,
    Unavailable,
}

/// Wallet provider failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Wallet not found for {0}")]
    WalletNotFound(Identity),

    #[error("Authentication failed for {0}")]
    AuthenticationFailed(Identity),
}

/// Ledger submission failure for a single member.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Submission failed: {reason}")]
pub struct SubmissionError {
    pub reason: String,
}

impl SubmissionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Amount {amount} exceeds maximum {max}")]
    AmountTooLarge { amount: u64, max: u64 },

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    // === Throttling ===
    #[error("Rate limited: {0}")]
    RateLimited(RateLimitReason),

    // === Execution ===
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    // === System Errors ===
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal invariant violated: {0}")]
    Internal(String),

    #[error("Engine is closed")]
    Closed,
}

impl EngineError {
    /// Stable code for logs and API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ZeroAmount => "ZERO_AMOUNT",
            EngineError::AmountTooLarge { .. } => "AMOUNT_TOO_LARGE",
            EngineError::InvalidIdentity(_) => "INVALID_IDENTITY",
            EngineError::RateLimited(_) => "RATE_LIMITED",
            EngineError::Submission(_) => "SUBMISSION_FAILED",
            EngineError::Wallet(WalletError::WalletNotFound(_)) => "WALLET_NOT_FOUND",
            EngineError::Wallet(WalletError::AuthenticationFailed(_)) => "AUTHENTICATION_FAILED",
            EngineError::Config(_) => "INVALID_CONFIG",
            EngineError::Internal(_) => "INTERNAL_ERROR",
            EngineError::Closed => "ENGINE_CLOSED",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ZeroAmount
            | EngineError::AmountTooLarge { .. }
            | EngineError::InvalidIdentity(_) => ErrorKind::Validation,
            EngineError::RateLimited(_) => ErrorKind::RateLimit,
            EngineError::Submission(_) | EngineError::Wallet(_) => ErrorKind::Submission,
            EngineError::Config(_) | EngineError::Internal(_) => ErrorKind::Internal,
            EngineError::Closed => ErrorKind::Unavailable,
        }
    }

    /// Whether the same call may succeed later without changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimit | ErrorKind::Submission
        )
    }
}

impl From<RateLimitReason> for EngineError {
    fn from(reason: RateLimitReason) -> Self {
        EngineError::RateLimited(reason)
    }
}

impl From<IdentityError> for EngineError {
    fn from(e: IdentityError) -> Self {
        EngineError::InvalidIdentity(e.to_string())
    }
}

impl From<GuardError> for EngineError {
    fn from(e: GuardError) -> Self {
        EngineError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::ZeroAmount.code(), "ZERO_AMOUNT");
        assert_eq!(
            EngineError::AmountTooLarge { amount: 5, max: 1 }.code(),
            "AMOUNT_TOO_LARGE"
        );
        assert_eq!(
            EngineError::Wallet(WalletError::WalletNotFound(Identity::from_bytes([0; 32])))
                .code(),
            "WALLET_NOT_FOUND"
        );
        assert_eq!(EngineError::Closed.code(), "ENGINE_CLOSED");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(EngineError::ZeroAmount.kind(), ErrorKind::Validation);
        assert_eq!(
            EngineError::from(RateLimitReason::GlobalQuotaExceeded { limit: 1 }).kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            EngineError::from(SubmissionError::new("rpc down")).kind(),
            ErrorKind::Submission
        );
        assert_eq!(
            EngineError::from(GuardError::EmptyKey).kind(),
            ErrorKind::Internal
        );
        assert_eq!(EngineError::Closed.kind(), ErrorKind::Unavailable);
    }

    #[test]
    fn test_retryable() {
        let limited = EngineError::RateLimited(RateLimitReason::SourceBlocked {
            retry_after: Duration::from_secs(1),
        });
        assert!(limited.is_retryable());
        assert!(!EngineError::ZeroAmount.is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            EngineError::from(SubmissionError::new("blockhash expired")).to_string(),
            "Submission failed: blockhash expired"
        );
        assert_eq!(
            EngineError::AmountTooLarge { amount: 10, max: 5 }.to_string(),
            "Amount 10 exceeds maximum 5"
        );
    }
}
