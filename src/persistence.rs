//! Persistence seam.
//!
//! Durability is delegated: when a commit touches persistent regions, the net
//! effect on those regions is handed to a `PersistenceSink` after reservation
//! and before the in-memory apply.

use parking_lot::Mutex;
use thiserror::Error;

use crate::distribution::ReplicatedOp;
use crate::transaction::TransactionId;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence rejected the write: {reason}")]
    Rejected { reason: String },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

pub trait PersistenceSink: Send + Sync {
    /// Makes `ops` durable. The version in each op is the one the apply will
    /// assign. `transaction` is `None` for non-transactional writes.
    fn persist(&self, transaction: Option<TransactionId>, ops: &[ReplicatedOp]) -> Result<()>;
}

/// Records what it is given; optionally refuses everything.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<(Option<TransactionId>, Vec<ReplicatedOp>)>>,
    refuse: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `persist` fail with `reason`.
    pub fn refuse_with(&self, reason: impl Into<String>) {
        *self.refuse.lock() = Some(reason.into());
    }

    pub fn records(&self) -> Vec<(Option<TransactionId>, Vec<ReplicatedOp>)> {
        self.records.lock().clone()
    }
}

impl PersistenceSink for MemoryPersistence {
    fn persist(&self, transaction: Option<TransactionId>, ops: &[ReplicatedOp]) -> Result<()> {
        if let Some(reason) = self.refuse.lock().clone() {
            return Err(PersistenceError::Rejected { reason });
        }
        self.records.lock().push((transaction, ops.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::MemberId;
    use bytes::Bytes;

    #[test]
    fn test_memory_persistence_records_and_refuses() {
        let sink = MemoryPersistence::new();
        let id = Some(TransactionId::new(MemberId::new(1), 1));
        let ops = vec![ReplicatedOp {
            region: "ledger".to_string(),
            key: Bytes::from("k"),
            value: Some(Bytes::from("v")),
            version: 1,
        }];

        sink.persist(id, &ops).unwrap();
        assert_eq!(sink.records(), vec![(id, ops.clone())]);

        sink.refuse_with("disk full");
        let err = sink.persist(id, &ops).unwrap_err();
        assert_eq!(err.to_string(), "Persistence rejected the write: disk full");
        assert_eq!(sink.records().len(), 1);
    }
}
