//! Transaction management module.
//!
//! This module provides transaction support for the grid, including:
//! - Transaction lifecycle (begin, commit, rollback, suspend, resume)
//! - Write sets with first-touch snapshots for repeatable reads
//! - Read sets for opt-in strict read validation
//! - A two-phase participant for external coordinators

pub mod context;
pub mod error;
pub mod id;
pub mod manager;
pub mod participant;
pub mod read_set;
pub mod state;
pub mod stats;
pub mod write_set;

// Re-export commonly used types
pub use context::TransactionContext;
pub use error::{ConflictReason, Result, TransactionError};
pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{SuspendHandle, Transaction, TransactionManager};
pub use participant::{ParticipantResource, TwoPhaseParticipant};
pub use read_set::ReadSet;
pub use state::{TransactionInfo, TransactionState};
pub use stats::{StatsSnapshot, TransactionStats};
pub use write_set::{EntryKey, Expect, Operation, WriteSet, WriteSetEntry};
