#![forbid(unsafe_code)]
//! Error types for the verso MVCC runtime.
//!
//! Defines `VersoError` and a `Result<T>` alias used throughout the
//! workspace. Commit contention is deliberately *not* represented here: a
//! conflicting commit returns `false` and the caller decides whether to
//! retry with a fresh transaction.

use thiserror::Error;
use verso_types::Epoch;

/// Unified error type for all verso operations.
///
/// Everything except `NoActiveTransaction` and `CleanupFailure` indicates a
/// corrupted invariant: a latent bug, not a recoverable condition. The
/// runtime logs a diagnostic dump before surfacing these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersoError {
    #[error("no active transaction bound to this operation")]
    NoActiveTransaction,

    #[error("cleanup registered with no live snapshots")]
    NoActiveSnapshot,

    #[error("history underflow: attempt to remove past the last remaining entry")]
    HistoryUnderflow,

    #[error("capacity violation: new capacity {requested} below current size {size}")]
    CapacityViolation { requested: usize, size: usize },

    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },

    #[error("cleanup of version starting at epoch {valid_from} failed: {detail}")]
    CleanupFailure { valid_from: Epoch, detail: String },
}

impl VersoError {
    /// Shorthand for an `InvariantViolation` with a formatted detail string.
    #[must_use]
    pub fn invariant(detail: impl Into<String>) -> Self {
        VersoError::InvariantViolation {
            detail: detail.into(),
        }
    }

    /// Whether this error indicates corrupted state rather than caller error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VersoError::HistoryUnderflow
                | VersoError::CapacityViolation { .. }
                | VersoError::InvariantViolation { .. }
        )
    }
}

/// Result alias using `VersoError`.
pub type Result<T> = std::result::Result<T, VersoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(VersoError::HistoryUnderflow.is_fatal());
        assert!(VersoError::invariant("epochs out of order").is_fatal());
        assert!(!VersoError::NoActiveTransaction.is_fatal());
        assert!(!VersoError::CleanupFailure {
            valid_from: Epoch(3),
            detail: "gone".into()
        }
        .is_fatal());
    }

    #[test]
    fn messages_name_the_epochs() {
        let err = VersoError::CleanupFailure {
            valid_from: Epoch(42),
            detail: "entry not found".into(),
        };
        assert!(err.to_string().contains("42"));
    }
}
