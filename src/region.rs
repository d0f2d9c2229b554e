//! Region storage model.
//!
//! Regions are key-value namespaces. This module provides:
//! - Versioned entries carrying an optimistic reservation marker
//! - Region kinds (partitioned, replicated, persistent) and host resolution
//! - The `RegionStore` seam and an in-memory store

pub mod entry;
pub mod kind;
pub mod store;

pub use entry::{RegionEntry, ReservationToken, VersionedValue};
pub use kind::{Host, PartitionAttributes, PartitionResolver, PrefixResolver, RegionKind};
pub use store::{BucketOwners, MemoryRegionStore, RegionStore};
