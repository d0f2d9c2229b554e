//! Replication messages exchanged between members.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{MemberId, Result};
use crate::transaction::TransactionId;

/// The net effect of a commit on one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedOp {
    pub region: String,
    pub key: Bytes,
    /// `None` removes the entry.
    pub value: Option<Bytes>,
    /// Version the primary assigned when applying.
    pub version: u64,
}

/// Everything a replica needs to catch up with one apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    pub origin: MemberId,
    /// `None` for non-transactional writes.
    pub transaction: Option<TransactionId>,
    pub ops: Vec<ReplicatedOp>,
}

impl ReplicationBatch {
    pub fn new(origin: MemberId, transaction: Option<TransactionId>) -> Self {
        Self {
            origin,
            transaction,
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
