//! Region kinds and their host-resolution rules.

use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::store::RegionStore;
use crate::distribution::MemberId;
use crate::transaction::Result;

pub const DEFAULT_TOTAL_BUCKETS: u32 = 113;

/// Maps a key to the object its bucket is derived from.
///
/// Keys that share a routing object share a bucket, and therefore a primary
/// host, which is how applications keep a transaction's data colocated.
pub trait PartitionResolver: Send + Sync {
    /// Returns the bytes hashed in place of `key`.
    fn routing_object(&self, key: &Bytes) -> Bytes;
}

/// Routes on the part of the key before the first `delimiter`.
pub struct PrefixResolver {
    delimiter: u8,
}

impl PrefixResolver {
    /// Creates a resolver splitting on `delimiter`. Keys without it route
    /// on the whole key.
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl PartitionResolver for PrefixResolver {
    fn routing_object(&self, key: &Bytes) -> Bytes {
        match key.iter().position(|b| *b == self.delimiter) {
            Some(end) => key.slice(..end),
            None => key.clone(),
        }
    }
}

/// Bucket layout of a partitioned region.
#[derive(Clone)]
pub struct PartitionAttributes {
    /// Number of buckets keys hash into.
    pub total_buckets: u32,
    /// Secondary copies kept of each bucket.
    pub redundant_copies: usize,
    /// Optional custom routing; `None` hashes the key itself.
    pub resolver: Option<Arc<dyn PartitionResolver>>,
}

impl PartitionAttributes {
    /// Creates attributes with no resolver. A zero bucket count is raised
    /// to one.
    pub fn new(total_buckets: u32, redundant_copies: usize) -> Self {
        Self {
            total_buckets: total_buckets.max(1),
            redundant_copies,
            resolver: None,
        }
    }

    /// Routes keys through `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn PartitionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Returns the bucket `key` belongs to.
    pub fn bucket_id(&self, key: &Bytes) -> u32 {
        let routing = match &self.resolver {
            Some(resolver) => resolver.routing_object(key),
            None => key.clone(),
        };
        let mut hasher = DefaultHasher::new();
        routing.hash(&mut hasher);
        (hasher.finish() % u64::from(self.total_buckets)) as u32
    }
}

impl Default for PartitionAttributes {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_BUCKETS, 1)
    }
}

impl std::fmt::Debug for PartitionAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionAttributes")
            .field("total_buckets", &self.total_buckets)
            .field("redundant_copies", &self.redundant_copies)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

/// How a region's data is laid out across members.
#[derive(Debug, Clone)]
pub enum RegionKind {
    /// Sharded into buckets, each with one primary and some secondaries.
    Partitioned(PartitionAttributes),
    /// Fully copied to every member.
    Replicated,
    /// Replicated, and also handed to the persistence collaborator.
    Persistent,
}

/// Where a key's primary copy lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    /// The bucket's primary owner.
    Member(MemberId),
    /// Every member holds the key; it does not constrain colocation.
    Any,
}

impl RegionKind {
    /// Returns true for bucketed regions.
    pub fn is_partitioned(&self) -> bool {
        matches!(self, Self::Partitioned(_))
    }

    /// Returns true if writes go through the persistence sink.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent)
    }

    /// Finds the member a transaction writing `key` must commit on.
    ///
    /// Partitioned keys resolve to their bucket's primary. Replicated and
    /// persistent keys resolve to [`Host::Any`].
    pub fn resolve_host(&self, store: &dyn RegionStore, region: &str, key: &Bytes) -> Result<Host> {
        match self {
            Self::Partitioned(attrs) => {
                let owners = store.bucket_owners(region, attrs.bucket_id(key))?;
                Ok(Host::Member(owners.primary))
            }
            Self::Replicated | Self::Persistent => Ok(Host::Any),
        }
    }

    /// Members other than `host` that keep a copy of `key`.
    pub fn replica_targets(
        &self,
        store: &dyn RegionStore,
        region: &str,
        key: &Bytes,
        host: MemberId,
    ) -> Result<Vec<MemberId>> {
        match self {
            Self::Partitioned(attrs) => {
                let owners = store.bucket_owners(region, attrs.bucket_id(key))?;
                Ok(owners
                    .secondaries
                    .into_iter()
                    .filter(|m| *m != host)
                    .collect())
            }
            Self::Replicated | Self::Persistent => Ok(store
                .members()
                .into_iter()
                .filter(|m| *m != host)
                .collect()),
        }
    }
}
