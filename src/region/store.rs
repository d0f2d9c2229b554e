//! Region store seam and the in-memory reference store.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

use super::entry::{RegionEntry, VersionedValue};
use super::kind::RegionKind;
use crate::distribution::MemberId;
use crate::transaction::{Result, TransactionError};

/// Members holding a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOwners {
    pub primary: MemberId,
    pub secondaries: Vec<MemberId>,
}

/// Physical storage of primary copies plus placement metadata.
pub trait RegionStore: Send + Sync {
    fn local_member(&self) -> MemberId;

    /// Every member hosting data, local member included.
    fn members(&self) -> Vec<MemberId>;

    fn create_region(&self, name: &str, kind: RegionKind) -> Result<()>;

    fn region_kind(&self, name: &str) -> Result<RegionKind>;

    /// The shared entry for `key`, created empty on first use.
    fn entry(&self, region: &str, key: &Bytes) -> Result<Arc<RegionEntry>>;

    /// Current value and version of `key` without creating an entry.
    fn peek(&self, region: &str, key: &Bytes) -> Result<VersionedValue>;

    fn bucket_owners(&self, region: &str, bucket: u32) -> Result<BucketOwners>;

    /// Keys that currently hold a value.
    fn keys(&self, region: &str) -> Result<Vec<Bytes>>;
}

struct RegionData {
    kind: RegionKind,
    entries: DashMap<Bytes, Arc<RegionEntry>>,
    buckets: Vec<BucketOwners>,
}

/// Keeps every region's primary copies in process, with buckets of
/// partitioned regions spread round-robin over the configured members.
pub struct MemoryRegionStore {
    local: MemberId,
    members: Vec<MemberId>,
    regions: DashMap<String, Arc<RegionData>>,
}

impl MemoryRegionStore {
    /// A store for a single-member grid.
    pub fn new(local: MemberId) -> Self {
        Self::with_members(local, vec![local])
    }

    pub fn with_members(local: MemberId, mut members: Vec<MemberId>) -> Self {
        if !members.contains(&local) {
            members.push(local);
        }
        members.sort();
        Self {
            local,
            members,
            regions: DashMap::new(),
        }
    }

    fn region(&self, name: &str) -> Result<Arc<RegionData>> {
        self.regions
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| TransactionError::RegionNotFound(name.to_string()))
    }

    fn assign_buckets(&self, kind: &RegionKind) -> Vec<BucketOwners> {
        let RegionKind::Partitioned(attrs) = kind else {
            return Vec::new();
        };
        let count = self.members.len();
        let copies = attrs.redundant_copies.min(count.saturating_sub(1));
        (0..attrs.total_buckets as usize)
            .map(|bucket| BucketOwners {
                primary: self.members[bucket % count],
                secondaries: (1..=copies)
                    .map(|i| self.members[(bucket + i) % count])
                    .collect(),
            })
            .collect()
    }
}

impl RegionStore for MemoryRegionStore {
    fn local_member(&self) -> MemberId {
        self.local
    }

    fn members(&self) -> Vec<MemberId> {
        self.members.clone()
    }

    fn create_region(&self, name: &str, kind: RegionKind) -> Result<()> {
        if self.regions.contains_key(name) {
            return Err(TransactionError::RegionExists(name.to_string()));
        }
        let buckets = self.assign_buckets(&kind);
        self.regions.insert(
            name.to_string(),
            Arc::new(RegionData {
                kind,
                entries: DashMap::new(),
                buckets,
            }),
        );
        Ok(())
    }

    fn region_kind(&self, name: &str) -> Result<RegionKind> {
        Ok(self.region(name)?.kind.clone())
    }

    fn entry(&self, region: &str, key: &Bytes) -> Result<Arc<RegionEntry>> {
        let data = self.region(region)?;
        let entry = data
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RegionEntry::new()));
        Ok(Arc::clone(entry.value()))
    }

    fn peek(&self, region: &str, key: &Bytes) -> Result<VersionedValue> {
        let data = self.region(region)?;
        Ok(data
            .entries
            .get(key)
            .map(|e| e.value().snapshot())
            .unwrap_or_default())
    }

    fn bucket_owners(&self, region: &str, bucket: u32) -> Result<BucketOwners> {
        let data = self.region(region)?;
        data.buckets.get(bucket as usize).cloned().ok_or_else(|| {
            TransactionError::UnsupportedOperation(format!(
                "region '{}' has no bucket {}",
                region, bucket
            ))
        })
    }

    fn keys(&self, region: &str) -> Result<Vec<Bytes>> {
        let data = self.region(region)?;
        Ok(data
            .entries
            .iter()
            .filter(|e| e.value().snapshot().value.is_some())
            .map(|e| e.key().clone())
            .collect())
    }
}
