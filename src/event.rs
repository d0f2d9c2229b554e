//! Commit-time callbacks.
//!
//! A single `TransactionWriter` may veto a commit before anything is
//! reserved. After a successful apply, `EntryListener`s see one conflated
//! event per key, then `TransactionListener`s see the whole transaction.

pub mod dispatcher;

pub use dispatcher::{CallbackKind, DispatchFailure, EventDispatcher};

use bytes::Bytes;
use thiserror::Error;

use crate::transaction::{Operation, TransactionId};

/// Raised by a callback. From a writer it vetoes the commit; from a listener
/// it is reported and otherwise ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type CallbackResult = std::result::Result<(), CallbackError>;

/// The net effect of a transaction (or a single non-transactional write) on
/// one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEvent {
    pub region: String,
    pub key: Bytes,
    pub operation: Operation,
    pub old_value: Option<Bytes>,
    pub new_value: Option<Bytes>,
    /// `None` for non-transactional writes.
    pub transaction: Option<TransactionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    pub id: TransactionId,
    /// Conflated per-key events in key-arrival order.
    pub events: Vec<EntryEvent>,
}

impl TransactionEvent {
    pub fn new(id: TransactionId, events: Vec<EntryEvent>) -> Self {
        Self { id, events }
    }
}

pub trait TransactionWriter: Send + Sync {
    fn before_commit(&self, event: &TransactionEvent) -> CallbackResult;
}

pub trait TransactionListener: Send + Sync {
    fn after_commit(&self, event: &TransactionEvent) -> CallbackResult;

    fn after_failed_commit(&self, _event: &TransactionEvent) -> CallbackResult {
        Ok(())
    }

    fn after_rollback(&self, _event: &TransactionEvent) -> CallbackResult {
        Ok(())
    }
}

pub trait EntryListener: Send + Sync {
    fn on_event(&self, event: &EntryEvent) -> CallbackResult;
}
