//! Distribution layer seam.
//!
//! Cluster membership and message delivery are owned by an external
//! collaborator. The engine only needs to know which members are alive and to
//! push the net effect of a commit to replica holders with a bounded wait.

pub mod loopback;
pub mod message;

pub use loopback::{LoopbackDistribution, ReplicaStore};
pub use message::{ReplicatedOp, ReplicationBatch};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Identity of a grid member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(u32);

impl MemberId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("{0} has departed the distributed system")]
    MemberDeparted(MemberId),

    #[error("{member} did not acknowledge within {timeout:?}")]
    AckTimeout { member: MemberId, timeout: Duration },

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, DistributionError>;

/// Per-target result of a replication round.
#[derive(Debug, Default)]
pub struct ReplicationReport {
    pub acknowledged: Vec<MemberId>,
    pub failed: Vec<(MemberId, DistributionError)>,
}

impl ReplicationReport {
    /// True when every target acknowledged.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_members(&self) -> Vec<MemberId> {
        self.failed.iter().map(|(member, _)| *member).collect()
    }
}

/// Reliable delivery between members, as seen by the transaction engine.
pub trait DistributionLayer: Send + Sync {
    /// The member this engine runs on.
    fn local_member(&self) -> MemberId;

    /// Whether `member` is currently part of the distributed system.
    fn is_alive(&self, member: MemberId) -> bool;

    /// Delivers `batch` to every target and waits up to `timeout` for
    /// acknowledgements. Retry and backoff are the implementation's business.
    fn replicate(
        &self,
        targets: &[MemberId],
        batch: &ReplicationBatch,
        timeout: Duration,
    ) -> Result<ReplicationReport>;
}
