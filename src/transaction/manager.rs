//! Transaction manager: binds contexts to threads and drives their lifecycle.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::context::TransactionContext;
use super::error::{Result, TransactionError};
use super::id::{TransactionId, TransactionIdGenerator};
use super::state::TransactionState;
use super::stats::{StatsSnapshot, TransactionStats};
use super::write_set::Expect;
use crate::concurrency::{pending_event, CommitOutcome, ReservationCoordinator};
use crate::config::TransactionConfig;
use crate::distribution::DistributionLayer;
use crate::event::{EntryListener, EventDispatcher, TransactionListener, TransactionWriter};
use crate::persistence::PersistenceSink;
use crate::region::{RegionKind, RegionStore};

/// Opaque reference to a suspended transaction.
///
/// The handle names the transaction, not one particular suspension, so it
/// stays valid across repeated suspend/resume cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SuspendHandle(TransactionId);

impl SuspendHandle {
    /// Returns the id of the suspended transaction.
    pub fn transaction_id(&self) -> TransactionId {
        self.0
    }
}

impl std::fmt::Display for SuspendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "suspended {}", self.0)
    }
}

/// Owns every live transaction context of one member and runs their
/// commits.
pub struct TransactionManager {
    config: TransactionConfig,
    store: Arc<dyn RegionStore>,
    id_generator: TransactionIdGenerator,
    /// The context bound to each thread.
    active: DashMap<ThreadId, TransactionContext>,
    suspended: Mutex<HashMap<SuspendHandle, TransactionContext>>,
    /// Signalled whenever a context is suspended.
    suspended_changed: Condvar,
    coordinator: ReservationCoordinator,
    dispatcher: Arc<EventDispatcher>,
    stats: Arc<TransactionStats>,
}

impl TransactionManager {
    pub fn new(
        config: TransactionConfig,
        store: Arc<dyn RegionStore>,
        distribution: Arc<dyn DistributionLayer>,
        persistence: Option<Arc<dyn PersistenceSink>>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let stats = Arc::new(TransactionStats::new());
        let coordinator = ReservationCoordinator::new(
            Arc::clone(&store),
            distribution,
            persistence,
            Arc::clone(&dispatcher),
            Arc::clone(&stats),
            config.operation_timeout,
        );
        Self {
            id_generator: TransactionIdGenerator::new(store.local_member()),
            config,
            store,
            active: DashMap::new(),
            suspended: Mutex::new(HashMap::new()),
            suspended_changed: Condvar::new(),
            coordinator,
            dispatcher,
            stats,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RegionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Begins a transaction on the calling thread.
    pub fn begin(&self) -> Result<TransactionId> {
        match self.active.entry(thread::current().id()) {
            Entry::Occupied(existing) => Err(TransactionError::IllegalState(format!(
                "thread is already participating in {}",
                existing.get().id()
            ))),
            Entry::Vacant(slot) => {
                let id = self.id_generator.next();
                slot.insert(TransactionContext::new(id, self.config.strict_reads));
                self.stats.begin();
                debug!("{} began", id);
                Ok(id)
            }
        }
    }

    /// Commits the calling thread's transaction.
    ///
    /// The context is gone afterwards whatever the outcome, and the thread is
    /// free to begin again.
    pub fn commit(&self) -> Result<CommitOutcome> {
        let context = self.take_active()?;
        let started = Instant::now();
        let result = self.coordinator.commit(context);
        self.record_commit(result, started)
    }

    /// Discards the calling thread's transaction. The store is never touched.
    pub fn rollback(&self) -> Result<()> {
        let context = self.take_active()?;
        self.discard(context);
        Ok(())
    }

    /// Detaches the calling thread's transaction. Until it is resumed, the
    /// thread behaves as if no transaction existed.
    pub fn suspend(&self) -> Result<SuspendHandle> {
        let mut context = self.take_active()?;
        self.expire_suspended();

        context.info_mut().suspend();
        let handle = SuspendHandle(context.id());
        self.suspended.lock().insert(handle, context);
        self.suspended_changed.notify_all();
        self.stats.suspended();
        debug!("{} suspended", handle.0);
        Ok(handle)
    }

    /// Rebinds a suspended transaction to the calling thread.
    pub fn resume(&self, handle: SuspendHandle) -> Result<()> {
        self.ensure_idle()?;
        let context = self.suspended.lock().remove(&handle).ok_or_else(|| {
            TransactionError::IllegalState(format!(
                "{} is not a known suspended transaction",
                handle.0
            ))
        })?;
        self.bind(context);
        Ok(())
    }

    /// Like [`resume`](Self::resume), but waits up to `timeout` for the
    /// transaction to become suspended. Returns `false` on timeout.
    pub fn try_resume(&self, handle: SuspendHandle, timeout: Duration) -> Result<bool> {
        self.ensure_idle()?;
        let deadline = Instant::now() + timeout;
        let mut suspended = self.suspended.lock();
        loop {
            if let Some(context) = suspended.remove(&handle) {
                drop(suspended);
                self.bind(context);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.suspended_changed.wait_until(&mut suspended, deadline);
        }
    }

    pub fn is_suspended(&self, handle: SuspendHandle) -> bool {
        self.suspended.lock().contains_key(&handle)
    }

    /// Whether the calling thread has an active transaction.
    pub fn exists(&self) -> bool {
        self.active.contains_key(&thread::current().id())
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.active
            .get(&thread::current().id())
            .map(|context| context.id())
    }

    /// A copy of the calling thread's context.
    pub fn current_context(&self) -> Option<TransactionContext> {
        self.active
            .get(&thread::current().id())
            .map(|context| context.value().clone())
    }

    /// Rolls back every transaction suspended for longer than the configured
    /// timeout. Returns how many were abandoned.
    pub fn expire_suspended(&self) -> usize {
        let Some(timeout) = self.config.suspended_timeout else {
            return 0;
        };
        let expired: Vec<TransactionContext> = {
            let mut suspended = self.suspended.lock();
            let handles: Vec<SuspendHandle> = suspended
                .iter()
                .filter(|(_, context)| {
                    context
                        .info()
                        .suspended_for()
                        .is_some_and(|idle| idle >= timeout)
                })
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .iter()
                .filter_map(|handle| suspended.remove(handle))
                .collect()
        };

        let count = expired.len();
        for context in expired {
            warn!(
                "{} abandoned after being suspended longer than {:?}",
                context.id(),
                timeout
            );
            self.stats.resumed();
            self.stats.expired();
            self.discard(context);
        }
        count
    }

    pub fn set_writer(
        &self,
        writer: Option<Arc<dyn TransactionWriter>>,
    ) -> Option<Arc<dyn TransactionWriter>> {
        self.dispatcher.set_writer(writer)
    }

    pub fn writer(&self) -> Option<Arc<dyn TransactionWriter>> {
        self.dispatcher.writer()
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.dispatcher.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) -> bool {
        self.dispatcher.remove_listener(listener)
    }

    pub fn add_entry_listener(&self, region: &str, listener: Arc<dyn EntryListener>) {
        self.dispatcher.add_entry_listener(region, listener);
    }

    /// Reads `key`, through the calling thread's transaction if it has one.
    pub(crate) fn get(&self, region: &str, key: &Bytes) -> Result<Option<Bytes>> {
        let kind = self.store.region_kind(region)?;
        let thread = thread::current().id();
        if let Some(mut context) = self.active.get_mut(&thread) {
            self.check_participation(&kind, region)?;
            return context.read(self.store.as_ref(), region, key);
        }
        Ok(self.store.peek(region, key)?.value)
    }

    /// Writes `key` (`None` removes), buffering into the calling thread's
    /// transaction if it has one. Returns the previously visible value.
    pub(crate) fn write(
        &self,
        region: &str,
        key: Bytes,
        value: Option<Bytes>,
        expect: Expect,
    ) -> Result<Option<Bytes>> {
        let kind = self.store.region_kind(region)?;
        let thread = thread::current().id();
        if let Some(mut context) = self.active.get_mut(&thread) {
            self.check_participation(&kind, region)?;
            return context.write(self.store.as_ref(), region, key, value, expect);
        }
        let single = self.coordinator.apply_single(region, &key, value, expect)?;
        Ok(single.previous)
    }

    /// Removes every entry of a region. Not available inside a transaction.
    pub(crate) fn clear(&self, region: &str) -> Result<usize> {
        if self.exists() {
            return Err(TransactionError::UnsupportedOperation(format!(
                "clear of region '{}'",
                region
            )));
        }
        let mut removed = 0;
        for key in self.store.keys(region)? {
            match self.coordinator.apply_single(region, &key, None, Expect::Present) {
                Ok(_) => removed += 1,
                Err(TransactionError::EntryNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    pub(crate) fn coordinator(&self) -> &ReservationCoordinator {
        &self.coordinator
    }

    /// Unbinds and returns the calling thread's context.
    pub(crate) fn take_active(&self) -> Result<TransactionContext> {
        self.active
            .remove(&thread::current().id())
            .map(|(_, context)| context)
            .ok_or_else(|| {
                TransactionError::IllegalState("thread has no active transaction".to_string())
            })
    }

    /// Updates counters for a finished commit attempt.
    pub(crate) fn record_commit(
        &self,
        result: Result<CommitOutcome>,
        started: Instant,
    ) -> Result<CommitOutcome> {
        match &result {
            Ok(outcome) => {
                self.stats.commit(
                    outcome.changes,
                    started.elapsed(),
                    !outcome.is_fully_acknowledged(),
                );
                debug!("{} committed {} changes", outcome.id, outcome.changes);
            }
            Err(TransactionError::CommitConflict { id, reason }) => {
                self.stats.conflict();
                debug!("{} failed to commit: {}", id, reason);
            }
            Err(TransactionError::NotColocated { .. }) => self.stats.not_colocated(),
            Err(e) => {
                self.stats.failure();
                debug!("commit failed: {}", e);
            }
        }
        result
    }

    /// Destroys a context without applying it.
    pub(crate) fn discard(&self, mut context: TransactionContext) {
        let event = pending_event(&context);
        context.info_mut().finish(TransactionState::RolledBack);
        self.stats.rollback(context.write_set().written_len());
        // Listener failures are logged by the dispatcher; rollback still succeeds.
        let failures = self.dispatcher.after_rollback(&event);
        debug!(
            "{} rolled back after {:?}, {} listener failures",
            context.id(),
            context.info().duration(),
            failures.len()
        );
    }

    fn bind(&self, mut context: TransactionContext) {
        context.info_mut().resume();
        self.stats.resumed();
        debug!("{} resumed", context.id());
        self.active.insert(thread::current().id(), context);
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.transaction_id() {
            Some(id) => Err(TransactionError::IllegalState(format!(
                "thread is already participating in {}",
                id
            ))),
            None => Ok(()),
        }
    }

    fn check_participation(&self, kind: &RegionKind, region: &str) -> Result<()> {
        if kind.is_persistent() && !self.config.persistent_participation {
            return Err(TransactionError::UnsupportedOperation(format!(
                "region '{}' is persistent and persistent regions do not take part in transactions",
                region
            )));
        }
        Ok(())
    }
}

/// A handle to a transaction that rolls back on drop unless it was finished.
///
/// The transaction stays bound to the creating thread; dropping the handle
/// on a thread where it is not active does nothing.
pub struct Transaction {
    id: TransactionId,
    manager: Arc<TransactionManager>,
    finished: bool,
}

impl Transaction {
    /// Begins a transaction on the calling thread.
    pub fn begin(manager: Arc<TransactionManager>) -> Result<Self> {
        let id = manager.begin()?;
        Ok(Self {
            id,
            manager,
            finished: false,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> Result<CommitOutcome> {
        self.finished = true;
        self.manager.commit()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.manager.rollback()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.manager.transaction_id() == Some(self.id) {
            let _ = self.manager.rollback();
        }
    }
}
