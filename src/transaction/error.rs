//! Transaction error types.

use std::time::Duration;
use thiserror::Error;

use super::id::TransactionId;
use crate::distribution::{DistributionError, MemberId};
use crate::persistence::PersistenceError;

/// Why a commit lost the race for its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another in-flight commit holds the key's reservation marker.
    KeyReserved { region: String },
    /// The key was modified after this transaction first touched it.
    VersionChanged {
        region: String,
        expected: u64,
        actual: u64,
    },
    /// A key read in strict mode was modified before commit.
    ReadInvalidated {
        region: String,
        expected: u64,
        actual: u64,
    },
    /// The registered transaction writer refused the commit.
    Vetoed(String),
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyReserved { region } => {
                write!(f, "key in region '{}' is reserved by another commit", region)
            }
            Self::VersionChanged {
                region,
                expected,
                actual,
            } => write!(
                f,
                "key in region '{}' changed (expected version {}, found {})",
                region, expected, actual
            ),
            Self::ReadInvalidated {
                region,
                expected,
                actual,
            } => write!(
                f,
                "key read from region '{}' changed (expected version {}, found {})",
                region, expected, actual
            ),
            Self::Vetoed(msg) => write!(f, "vetoed by transaction writer: {}", msg),
        }
    }
}

/// Errors raised by transactional operations.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Illegal transaction state: {0}")]
    IllegalState(String),

    #[error("Transaction data is not colocated: keys are hosted by {members:?}")]
    NotColocated { members: Vec<MemberId> },

    #[error("Commit conflict in {id}: {reason}")]
    CommitConflict {
        id: TransactionId,
        reason: ConflictReason,
    },

    /// A non-transactional write waited the whole operation timeout for a
    /// commit's marker on its key.
    #[error("Timed out after {timeout:?} waiting for a reserved key in region '{region}'")]
    ReservationTimeout { region: String, timeout: Duration },

    #[error("Unsupported operation in transaction: {0}")]
    UnsupportedOperation(String),

    #[error("Distribution failure: {0}")]
    Distribution(#[from] DistributionError),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Region not found: {0}")]
    RegionNotFound(String),

    #[error("Region already exists: {0}")]
    RegionExists(String),

    #[error("Entry not found in region '{0}'")]
    EntryNotFound(String),

    #[error("Entry already exists in region '{0}'")]
    EntryExists(String),
}

impl TransactionError {
    /// Whether a brand-new transaction doing the same work may succeed.
    ///
    /// Distribution errors only surface before reservation; failures after
    /// reservation are reported through the commit outcome instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommitConflict { .. } | Self::Distribution(_) | Self::ReservationTimeout { .. }
        )
    }

    /// Whether this is a commit conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::CommitConflict { .. })
    }
}

/// Result type for transactional operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
