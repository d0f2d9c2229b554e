//! In-process distribution layer.
//!
//! Every member's replica copies live in this process. Messages still go
//! through the wire codec so encoding problems surface the same way they
//! would across a network.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::message::ReplicationBatch;
use super::{DistributionError, DistributionLayer, MemberId, ReplicationReport, Result};
use crate::region::VersionedValue;

/// A member's secondary copies.
#[derive(Debug, Default)]
pub struct ReplicaStore {
    entries: DashMap<(String, Bytes), VersionedValue>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies each op unless the replica already holds a newer version.
    pub fn apply(&self, batch: &ReplicationBatch) {
        for op in &batch.ops {
            let mut slot = self
                .entries
                .entry((op.region.clone(), op.key.clone()))
                .or_default();
            if op.version > slot.version {
                *slot = VersionedValue::new(op.value.clone(), op.version);
            }
        }
    }

    pub fn get(&self, region: &str, key: &Bytes) -> Option<VersionedValue> {
        self.entries
            .get(&(region.to_string(), key.clone()))
            .map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Up,
    /// Still a member, but never acknowledges.
    Unresponsive,
    Departed,
}

pub struct LoopbackDistribution {
    local: MemberId,
    links: RwLock<HashMap<MemberId, LinkStatus>>,
    replicas: DashMap<MemberId, Arc<ReplicaStore>>,
    delivered: AtomicU64,
}

impl LoopbackDistribution {
    pub fn new(local: MemberId, members: &[MemberId]) -> Self {
        let links = members
            .iter()
            .chain(std::iter::once(&local))
            .map(|m| (*m, LinkStatus::Up))
            .collect::<HashMap<_, _>>();
        let replicas = DashMap::new();
        for member in links.keys() {
            replicas.insert(*member, Arc::new(ReplicaStore::new()));
        }
        Self {
            local,
            links: RwLock::new(links),
            replicas,
            delivered: AtomicU64::new(0),
        }
    }

    /// The replica copies held by `member`.
    pub fn replica(&self, member: MemberId) -> Option<Arc<ReplicaStore>> {
        self.replicas.get(&member).map(|r| Arc::clone(r.value()))
    }

    /// Simulates `member` crashing or leaving.
    pub fn depart(&self, member: MemberId) {
        log::info!("{} departed", member);
        self.links.write().insert(member, LinkStatus::Departed);
    }

    /// Keeps `member` in the view but stops it acknowledging.
    pub fn set_unresponsive(&self, member: MemberId) {
        self.links.write().insert(member, LinkStatus::Unresponsive);
    }

    pub fn restore(&self, member: MemberId) {
        self.links.write().insert(member, LinkStatus::Up);
    }

    /// Number of batches delivered and applied by replicas.
    pub fn delivered_batches(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn status(&self, member: MemberId) -> LinkStatus {
        self.links
            .read()
            .get(&member)
            .copied()
            .unwrap_or(LinkStatus::Departed)
    }
}

impl DistributionLayer for LoopbackDistribution {
    fn local_member(&self) -> MemberId {
        self.local
    }

    fn is_alive(&self, member: MemberId) -> bool {
        self.status(member) != LinkStatus::Departed
    }

    fn replicate(
        &self,
        targets: &[MemberId],
        batch: &ReplicationBatch,
        timeout: Duration,
    ) -> Result<ReplicationReport> {
        let wire = batch.encode()?;
        let mut report = ReplicationReport::default();

        for &member in targets {
            match self.status(member) {
                LinkStatus::Departed => report
                    .failed
                    .push((member, DistributionError::MemberDeparted(member))),
                LinkStatus::Unresponsive => report
                    .failed
                    .push((member, DistributionError::AckTimeout { member, timeout })),
                LinkStatus::Up => {
                    let received = match ReplicationBatch::decode(&wire) {
                        Ok(received) => received,
                        Err(e) => {
                            report.failed.push((member, e));
                            continue;
                        }
                    };
                    if let Some(replica) = self.replica(member) {
                        replica.apply(&received);
                    }
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    report.acknowledged.push(member);
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::ReplicatedOp;

    fn batch(version: u64, value: Option<&'static str>) -> ReplicationBatch {
        let mut batch = ReplicationBatch::new(MemberId::new(1), None);
        batch.ops.push(ReplicatedOp {
            region: "r".to_string(),
            key: Bytes::from("k"),
            value: value.map(Bytes::from),
            version,
        });
        batch
    }

    fn cluster() -> LoopbackDistribution {
        LoopbackDistribution::new(
            MemberId::new(1),
            &[MemberId::new(1), MemberId::new(2), MemberId::new(3)],
        )
    }

    #[test]
    fn test_replicate_to_live_members() {
        let dist = cluster();
        let targets = [MemberId::new(2), MemberId::new(3)];

        let report = dist
            .replicate(&targets, &batch(1, Some("a")), Duration::from_secs(1))
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.acknowledged, targets.to_vec());
        assert_eq!(dist.delivered_batches(), 2);
        let copy = dist
            .replica(MemberId::new(3))
            .unwrap()
            .get("r", &Bytes::from("k"))
            .unwrap();
        assert_eq!(copy, VersionedValue::new(Some(Bytes::from("a")), 1));
    }

    #[test]
    fn test_replica_ignores_stale_versions() {
        let replica = ReplicaStore::new();
        replica.apply(&batch(5, Some("new")));
        replica.apply(&batch(4, Some("old")));

        let copy = replica.get("r", &Bytes::from("k")).unwrap();
        assert_eq!(copy.value, Some(Bytes::from("new")));
        assert_eq!(copy.version, 5);
    }

    #[test]
    fn test_failed_members_reported() {
        let dist = cluster();
        dist.depart(MemberId::new(2));
        dist.set_unresponsive(MemberId::new(3));

        assert!(!dist.is_alive(MemberId::new(2)));
        assert!(dist.is_alive(MemberId::new(3)));

        let report = dist
            .replicate(
                &[MemberId::new(2), MemberId::new(3)],
                &batch(1, Some("a")),
                Duration::from_millis(10),
            )
            .unwrap();

        assert!(!report.is_complete());
        assert_eq!(
            report.failed_members(),
            vec![MemberId::new(2), MemberId::new(3)]
        );
        assert!(matches!(
            report.failed[1].1,
            DistributionError::AckTimeout { .. }
        ));

        dist.restore(MemberId::new(2));
        assert!(dist.is_alive(MemberId::new(2)));
    }

    #[test]
    fn test_unknown_member_is_not_alive() {
        let dist = cluster();
        assert!(!dist.is_alive(MemberId::new(99)));
    }
}
