//! Participant callbacks for an external global-transaction coordinator.

use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use std::time::Instant;

use super::error::{Result, TransactionError};
use super::id::TransactionId;
use super::manager::TransactionManager;
use crate::concurrency::{CommitOutcome, PreparedCommit};

/// The vote/commit/rollback surface a global coordinator drives.
pub trait TwoPhaseParticipant {
    /// Detaches the calling thread's transaction and reserves its keys. An
    /// error is a "no" vote; the transaction is gone afterwards.
    fn prepare(&self) -> Result<TransactionId>;

    fn commit(&self, id: TransactionId) -> Result<CommitOutcome>;

    /// Releases the markers of a prepared transaction and discards it.
    fn rollback(&self, id: TransactionId) -> Result<()>;
}

/// Participant backed by a [`TransactionManager`].
///
/// Prepared transactions hold their reservation markers until `commit` or
/// `rollback` names them, so the coordinator must always finish what it
/// prepares.
pub struct ParticipantResource {
    manager: Arc<TransactionManager>,
    prepared: DashMap<TransactionId, (PreparedCommit, Instant)>,
}

impl ParticipantResource {
    pub fn new(manager: Arc<TransactionManager>) -> Self {
        Self {
            manager,
            prepared: DashMap::new(),
        }
    }

    pub fn is_prepared(&self, id: TransactionId) -> bool {
        self.prepared.contains_key(&id)
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    fn take(&self, id: TransactionId) -> Result<(PreparedCommit, Instant)> {
        self.prepared
            .remove(&id)
            .map(|(_, prepared)| prepared)
            .ok_or_else(|| TransactionError::IllegalState(format!("{} is not prepared", id)))
    }
}

impl TwoPhaseParticipant for ParticipantResource {
    fn prepare(&self) -> Result<TransactionId> {
        let context = self.manager.take_active()?;
        let started = Instant::now();
        match self.manager.coordinator().prepare(context) {
            Ok(mut prepared) => {
                prepared.context_mut().info_mut().prepare();
                let id = prepared.id();
                debug!("{} prepared on {}", id, prepared.host());
                self.prepared.insert(id, (prepared, started));
                Ok(id)
            }
            Err(e) => self.manager.record_commit(Err(e), started).map(|o| o.id),
        }
    }

    fn commit(&self, id: TransactionId) -> Result<CommitOutcome> {
        let (prepared, started) = self.take(id)?;
        let result = self.manager.coordinator().complete(prepared);
        self.manager.record_commit(result, started)
    }

    fn rollback(&self, id: TransactionId) -> Result<()> {
        let (prepared, _) = self.take(id)?;
        self.manager.discard(prepared.abandon());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionConfig;
    use crate::distribution::{LoopbackDistribution, MemberId};
    use crate::region::{MemoryRegionStore, RegionKind, RegionStore};
    use crate::transaction::Expect;
    use bytes::Bytes;

    fn participant() -> (Arc<TransactionManager>, ParticipantResource) {
        let store = Arc::new(MemoryRegionStore::new(MemberId::new(1)));
        store.create_region("r", RegionKind::Replicated).unwrap();
        let distribution = Arc::new(LoopbackDistribution::new(
            MemberId::new(1),
            &[MemberId::new(1)],
        ));
        let manager = Arc::new(TransactionManager::new(
            TransactionConfig::default(),
            store,
            distribution,
            None,
        ));
        let resource = ParticipantResource::new(Arc::clone(&manager));
        (manager, resource)
    }

    fn buffer(manager: &TransactionManager, key: &'static str, value: &'static str) {
        manager
            .write("r", Bytes::from(key), Some(Bytes::from(value)), Expect::Any)
            .unwrap();
    }

    #[test]
    fn test_prepare_then_commit() {
        let (manager, resource) = participant();
        manager.begin().unwrap();
        buffer(&manager, "k", "v");

        let id = resource.prepare().unwrap();
        assert!(!manager.exists());
        assert!(resource.is_prepared(id));
        let entry = manager.store().entry("r", &Bytes::from("k")).unwrap();
        assert!(entry.is_reserved());

        let outcome = resource.commit(id).unwrap();
        assert_eq!(outcome.id, id);
        assert_eq!(outcome.changes, 1);
        assert!(!entry.is_reserved());
        assert_eq!(
            manager.store().peek("r", &Bytes::from("k")).unwrap().value,
            Some(Bytes::from("v"))
        );
        assert_eq!(manager.stats().commits, 1);
    }

    #[test]
    fn test_prepared_keys_block_other_commits() {
        let (manager, resource) = participant();
        manager.begin().unwrap();
        buffer(&manager, "k", "first");
        let id = resource.prepare().unwrap();

        manager.begin().unwrap();
        buffer(&manager, "k", "second");
        let err = manager.commit().unwrap_err();
        assert!(err.is_conflict());

        resource.rollback(id).unwrap();
        assert_eq!(manager.store().peek("r", &Bytes::from("k")).unwrap().value, None);
        assert!(!manager
            .store()
            .entry("r", &Bytes::from("k"))
            .unwrap()
            .is_reserved());
        assert_eq!(resource.prepared_count(), 0);
    }

    #[test]
    fn test_failed_prepare_votes_no() {
        let (manager, resource) = participant();
        manager.begin().unwrap();
        buffer(&manager, "k", "mine");
        let handle = manager.suspend().unwrap();
        buffer(&manager, "k", "theirs");
        manager.resume(handle).unwrap();

        assert!(resource.prepare().unwrap_err().is_conflict());
        assert!(!manager.exists());
        assert_eq!(resource.prepared_count(), 0);
        assert_eq!(manager.stats().conflicts, 1);
    }

    #[test]
    fn test_unknown_id_is_illegal() {
        let (_manager, resource) = participant();
        let id = TransactionId::new(MemberId::new(1), 42);
        assert!(matches!(
            resource.commit(id),
            Err(TransactionError::IllegalState(_))
        ));
        assert!(matches!(
            resource.rollback(id),
            Err(TransactionError::IllegalState(_))
        ));
        assert!(matches!(
            resource.prepare(),
            Err(TransactionError::IllegalState(_))
        ));
    }
}
