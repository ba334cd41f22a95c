//! Error types for the ledger

use crate::types::Record;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Two families matter to clients: [`Error::ConcurrentMutation`] is always
/// retryable after re-reading the conflicting record, while
/// [`Error::TransactionInvalid`] is a policy/shape rejection that never
/// succeeds on resubmission of the same bytes.
#[derive(Error, Debug)]
pub enum Error {
    /// A record version check or compare-and-swap failed.
    ///
    /// Carries the offending record so the caller can diagnose the
    /// conflicting key/version.
    #[error("concurrent mutation on record {}", .0.key)]
    ConcurrentMutation(Box<Record>),

    /// Transaction rejected by the validation pipeline
    #[error("transaction rejected ({}): {detail}", .reason.code())]
    TransactionInvalid {
        /// Stable reason code, part of the client contract
        reason: ValidationReason,
        /// Human-readable detail, not part of the contract
        detail: String,
    },

    /// Storage error (RocksDB, document store)
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (worker channel closed, etc.)
    #[error("concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a validation rejection
    pub fn invalid(reason: ValidationReason, detail: impl Into<String>) -> Self {
        Error::TransactionInvalid {
            reason,
            detail: detail.into(),
        }
    }

    /// Reason code if this is a validation rejection
    pub fn reason(&self) -> Option<&ValidationReason> {
        match self {
            Error::TransactionInvalid { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Stable, string-typed rejection reason codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationReason {
    /// Malformed mutation bytes or invalid shape
    InvalidMutation,
    /// Mutation namespace does not match the ledger's
    InvalidNamespace,
    /// Balance deltas for an asset do not net to zero
    UnbalancedTransaction,
    /// A signature-evidence entry failed verification
    InvalidSignature,
    /// Storage rejected the commit on a stale version
    OptimisticConcurrency,
    /// A record key does not round-trip byte-exact
    NonCanonicalSerialization,
    /// A ledger path failed segment validation
    InvalidPath,
    /// A record value is not interpretable (e.g. bad balance length)
    InvalidRecord,
    /// Account write without the account-modify permission
    AccountModificationUnauthorized,
    /// Account creation without the account-create permission
    AccountCreationUnauthorized,
    /// Balance decrease without the spend permission
    CannotSpendFromAccount,
    /// Negative resulting balance without the issuance permission
    CannotIssueAsset,
    /// Data write without the data-modify permission
    CannotModifyData,
    /// Reason raised by a pluggable mutation validator
    Custom(String),
}

impl ValidationReason {
    /// Stable wire code
    pub fn code(&self) -> &str {
        match self {
            ValidationReason::InvalidMutation => "InvalidMutation",
            ValidationReason::InvalidNamespace => "InvalidNamespace",
            ValidationReason::UnbalancedTransaction => "UnbalancedTransaction",
            ValidationReason::InvalidSignature => "InvalidSignature",
            ValidationReason::OptimisticConcurrency => "OptimisticConcurrency",
            ValidationReason::NonCanonicalSerialization => "NonCanonicalSerialization",
            ValidationReason::InvalidPath => "InvalidPath",
            ValidationReason::InvalidRecord => "InvalidRecord",
            ValidationReason::AccountModificationUnauthorized => {
                "AccountModificationUnauthorized"
            }
            ValidationReason::AccountCreationUnauthorized => "AccountCreationUnauthorized",
            ValidationReason::CannotSpendFromAccount => "CannotSpendFromAccount",
            ValidationReason::CannotIssueAsset => "CannotIssueAsset",
            ValidationReason::CannotModifyData => "CannotModifyData",
            ValidationReason::Custom(code) => code,
        }
    }
}

impl std::fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_stable() {
        assert_eq!(ValidationReason::InvalidMutation.code(), "InvalidMutation");
        assert_eq!(
            ValidationReason::OptimisticConcurrency.code(),
            "OptimisticConcurrency"
        );
        assert_eq!(
            ValidationReason::Custom("FeePolicyViolation".to_string()).code(),
            "FeePolicyViolation"
        );
    }

    #[test]
    fn test_invalid_helper() {
        let err = Error::invalid(ValidationReason::InvalidNamespace, "wrong ledger");
        assert_eq!(err.reason(), Some(&ValidationReason::InvalidNamespace));
    }
}
