//! Application-facing entry point: a cache of named regions.
//!
//! Every `Region` call checks whether the calling thread has an active
//! transaction. If it does, the call reads from or buffers into that
//! transaction; otherwise it goes straight to the store as a single-key
//! operation.

use bytes::Bytes;
use std::sync::Arc;

use crate::config::TransactionConfig;
use crate::distribution::{DistributionLayer, LoopbackDistribution, MemberId};
use crate::event::EntryListener;
use crate::persistence::{MemoryPersistence, PersistenceSink};
use crate::region::{MemoryRegionStore, RegionKind, RegionStore};
use crate::transaction::{Expect, Result, TransactionError, TransactionManager};

/// A set of named regions sharing one transaction manager.
pub struct Cache {
    manager: Arc<TransactionManager>,
}

impl Cache {
    pub fn new(
        config: TransactionConfig,
        store: Arc<dyn RegionStore>,
        distribution: Arc<dyn DistributionLayer>,
        persistence: Option<Arc<dyn PersistenceSink>>,
    ) -> Self {
        Self {
            manager: Arc::new(TransactionManager::new(
                config,
                store,
                distribution,
                persistence,
            )),
        }
    }

    /// An in-process cluster of `members` seen from `local`, with in-memory
    /// storage, loopback replication and in-memory persistence.
    pub fn in_process(config: TransactionConfig, local: MemberId, members: &[MemberId]) -> Self {
        let mut all = members.to_vec();
        if !all.contains(&local) {
            all.push(local);
        }
        let store = Arc::new(MemoryRegionStore::with_members(local, all.clone()));
        let distribution = Arc::new(LoopbackDistribution::new(local, &all));
        Self::new(
            config,
            store,
            distribution,
            Some(Arc::new(MemoryPersistence::new())),
        )
    }

    /// Returns the manager that begins, suspends and commits transactions
    /// for every region of this cache.
    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Creates a region and returns a handle to it.
    pub fn create_region(&self, name: &str, kind: RegionKind) -> Result<Region> {
        self.manager.store().create_region(name, kind)?;
        log::info!("created region '{}'", name);
        self.region(name)
    }

    /// Opens an existing region.
    pub fn region(&self, name: &str) -> Result<Region> {
        self.manager.store().region_kind(name)?;
        Ok(Region {
            name: name.to_string(),
            manager: Arc::clone(&self.manager),
        })
    }
}

/// A handle to one region. Cheap to clone and share between threads.
#[derive(Clone)]
pub struct Region {
    name: String,
    manager: Arc<TransactionManager>,
}

impl Region {
    /// Returns the region name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Result<RegionKind> {
        self.manager.store().region_kind(&self.name)
    }

    /// Returns the value visible to the caller: the transaction's view inside
    /// a transaction, the committed value outside one.
    pub fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.manager.get(&self.name, &key.into())
    }

    pub fn contains_key(&self, key: impl Into<Bytes>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Stores `value` and returns the previously visible value.
    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.manager
            .write(&self.name, key.into(), Some(value.into()), Expect::Any)
    }

    /// Stores `value` only if the key is not visible.
    pub fn create(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.manager
            .write(&self.name, key.into(), Some(value.into()), Expect::Absent)
            .map(|_| ())
    }

    /// Removes the key and returns its value.
    pub fn remove(&self, key: impl Into<Bytes>) -> Result<Bytes> {
        self.manager
            .write(&self.name, key.into(), None, Expect::Present)?
            .ok_or_else(|| TransactionError::EntryNotFound(self.name.clone()))
    }

    /// Removes every entry and returns how many there were.
    pub fn clear(&self) -> Result<usize> {
        self.manager.clear(&self.name)
    }

    /// Registers a listener for this region's entry events.
    pub fn add_listener(&self, listener: Arc<dyn EntryListener>) {
        self.manager.add_entry_listener(&self.name, listener);
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CallbackResult, EntryEvent};
    use crate::transaction::Operation;
    use parking_lot::Mutex;

    fn cache() -> Cache {
        Cache::in_process(TransactionConfig::default(), MemberId::new(1), &[])
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EntryEvent>>,
    }

    impl EntryListener for Recorder {
        fn on_event(&self, event: &EntryEvent) -> CallbackResult {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn test_region_lookup() {
        let cache = cache();
        assert!(matches!(
            cache.region("missing"),
            Err(TransactionError::RegionNotFound(_))
        ));
        cache.create_region("r", RegionKind::Replicated).unwrap();
        assert!(matches!(
            cache.create_region("r", RegionKind::Replicated),
            Err(TransactionError::RegionExists(_))
        ));
        assert!(matches!(
            cache.region("r").unwrap().kind().unwrap(),
            RegionKind::Replicated
        ));
    }

    #[test]
    fn test_non_transactional_operations() {
        let cache = cache();
        let region = cache.create_region("r", RegionKind::Replicated).unwrap();

        assert_eq!(region.put("k", "1").unwrap(), None);
        assert_eq!(region.put("k", "2").unwrap(), Some(Bytes::from("1")));
        assert!(matches!(
            region.create("k", "3"),
            Err(TransactionError::EntryExists(_))
        ));
        assert!(region.contains_key("k").unwrap());
        assert_eq!(region.remove("k").unwrap(), Bytes::from("2"));
        assert!(matches!(
            region.remove("k"),
            Err(TransactionError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_transactional_operations_are_buffered() {
        let cache = cache();
        let region = cache.create_region("r", RegionKind::Replicated).unwrap();
        let manager = cache.transaction_manager();

        manager.begin().unwrap();
        region.create("k", "v").unwrap();
        assert_eq!(region.get("k").unwrap(), Some(Bytes::from("v")));
        assert!(matches!(
            region.clear(),
            Err(TransactionError::UnsupportedOperation(_))
        ));
        let handle = manager.suspend().unwrap();
        assert_eq!(region.get("k").unwrap(), None);
        manager.resume(handle).unwrap();
        manager.commit().unwrap();

        assert_eq!(region.get("k").unwrap(), Some(Bytes::from("v")));
        assert_eq!(region.clear().unwrap(), 1);
        assert!(!region.contains_key("k").unwrap());
    }

    #[test]
    fn test_entry_listener_sees_both_paths() {
        let cache = cache();
        let region = cache.create_region("r", RegionKind::Replicated).unwrap();
        let recorder = Arc::new(Recorder::default());
        region.add_listener(recorder.clone());

        region.put("a", "1").unwrap();
        let id = cache.transaction_manager().begin().unwrap();
        region.put("a", "2").unwrap();
        region.put("b", "x").unwrap();
        region.remove("b").unwrap();
        cache.transaction_manager().commit().unwrap();

        let events = recorder.events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].transaction, None);
        assert_eq!(events[0].operation, Operation::Create);
        assert_eq!(events[1].transaction, Some(id));
        assert_eq!(events[1].operation, Operation::Update);
        assert_eq!(events[1].old_value, Some(Bytes::from("1")));
        assert_eq!(events[1].new_value, Some(Bytes::from("2")));
    }
}
