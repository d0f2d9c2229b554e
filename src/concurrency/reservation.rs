//! The commit protocol.
//!
//! A commit runs in two halves. `prepare` resolves the host, lets the writer
//! veto, validates strict reads and reserves every written key.
//! `complete` applies, replicates, releases and dispatches events. Markers
//! are owned by a `Reservation`, which releases them when dropped, so no exit
//! path can leak one.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::colocation::resolve_host;
use crate::distribution::{
    DistributionError, DistributionLayer, MemberId, ReplicatedOp, ReplicationBatch,
};
use crate::event::{DispatchFailure, EntryEvent, EventDispatcher, TransactionEvent};
use crate::persistence::PersistenceSink;
use crate::region::{Host, RegionEntry, RegionStore, ReservationToken};
use crate::transaction::{
    ConflictReason, EntryKey, Expect, Operation, Result, TransactionContext, TransactionError,
    TransactionId, TransactionState, TransactionStats,
};

/// Yields before a non-transactional write starts sleeping on a marker.
const SPIN_ATTEMPTS: u32 = 64;
const MARKER_BACKOFF: Duration = Duration::from_micros(200);

type Reserved = (Reservation, HashMap<EntryKey, Arc<RegionEntry>>);

/// Markers placed on behalf of one commit.
pub struct Reservation {
    token: ReservationToken,
    entries: Vec<Arc<RegionEntry>>,
}

impl Reservation {
    fn new() -> Self {
        Self {
            token: ReservationToken::next(),
            entries: Vec::new(),
        }
    }

    pub fn token(&self) -> ReservationToken {
        self.token
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        for entry in &self.entries {
            entry.release(self.token);
        }
    }
}

/// One buffered mutation, resolved against the store.
struct PlannedWrite {
    key: EntryKey,
    entry: Arc<RegionEntry>,
    operation: Operation,
    value: Option<Bytes>,
    persistent: bool,
    replicas: Vec<MemberId>,
    noop: bool,
}

/// A commit whose keys are all reserved.
pub struct PreparedCommit {
    context: TransactionContext,
    host: MemberId,
    plan: Vec<PlannedWrite>,
    reservation: Reservation,
}

impl PreparedCommit {
    pub fn id(&self) -> TransactionId {
        self.context.id()
    }

    pub fn host(&self) -> MemberId {
        self.host
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub(crate) fn context_mut(&mut self) -> &mut TransactionContext {
        &mut self.context
    }

    /// Gives up the commit, releasing every marker.
    pub fn abandon(self) -> TransactionContext {
        drop(self.reservation);
        self.context
    }
}

/// The successful result of a commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub id: TransactionId,
    pub host: MemberId,
    /// Keys whose value changed.
    pub changes: usize,
    /// Time from begin to the end of apply.
    pub duration: Duration,
    /// Replica holders that did not acknowledge.
    pub degraded_members: Vec<MemberId>,
    pub dispatch_failures: Vec<DispatchFailure>,
}

impl CommitOutcome {
    pub fn is_fully_acknowledged(&self) -> bool {
        self.degraded_members.is_empty()
    }
}

/// The result of a non-transactional write.
#[derive(Debug, Clone)]
pub struct SingleWrite {
    pub previous: Option<Bytes>,
    pub degraded_members: Vec<MemberId>,
    pub dispatch_failures: Vec<DispatchFailure>,
}

/// Builds the event describing what a context would change.
pub fn pending_event(context: &TransactionContext) -> TransactionEvent {
    let events = context
        .write_set()
        .written()
        .filter(|(_, entry)| !entry.is_noop())
        .filter_map(|(key, entry)| {
            Some(EntryEvent {
                region: key.region.clone(),
                key: key.key.clone(),
                operation: entry.operation()?,
                old_value: entry.original_value().cloned(),
                new_value: entry.new_value().cloned(),
                transaction: Some(context.id()),
            })
        })
        .collect();
    TransactionEvent::new(context.id(), events)
}

pub struct ReservationCoordinator {
    store: Arc<dyn RegionStore>,
    distribution: Arc<dyn DistributionLayer>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    dispatcher: Arc<EventDispatcher>,
    stats: Arc<TransactionStats>,
    operation_timeout: Duration,
}

impl ReservationCoordinator {
    pub fn new(
        store: Arc<dyn RegionStore>,
        distribution: Arc<dyn DistributionLayer>,
        persistence: Option<Arc<dyn PersistenceSink>>,
        dispatcher: Arc<EventDispatcher>,
        stats: Arc<TransactionStats>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            distribution,
            persistence,
            dispatcher,
            stats,
            operation_timeout,
        }
    }

    /// Runs the whole protocol.
    pub fn commit(&self, context: TransactionContext) -> Result<CommitOutcome> {
        let prepared = self.prepare(context)?;
        self.complete(prepared)
    }

    /// Colocation, writer veto, read validation and reservation.
    ///
    /// A conflict releases every marker this call placed before the
    /// failed-commit listeners run.
    pub fn prepare(&self, mut context: TransactionContext) -> Result<PreparedCommit> {
        let id = context.id();
        let assignment = resolve_host(self.store.as_ref(), context.write_set())?;
        let host = assignment.host;
        context.set_host(host);

        if !self.distribution.is_alive(host) {
            return Err(DistributionError::MemberDeparted(host).into());
        }

        if context.write_set().written_len() > 0 {
            let event = pending_event(&context);
            if let Err(veto) = self.dispatcher.before_commit(&event) {
                log::debug!("{} vetoed by transaction writer: {}", id, veto);
                let reason = ConflictReason::Vetoed(veto.to_string());
                return Err(self.conflict(&mut context, reason));
            }
        }

        if let Some(reason) = self.invalidated_read(&context)? {
            return Err(self.conflict(&mut context, reason));
        }

        let (reservation, reserved) = match self.reserve(&context)? {
            Ok(reserved) => reserved,
            Err(reason) => return Err(self.conflict(&mut context, reason)),
        };

        let mut plan = Vec::with_capacity(reserved.len());
        for (key, write) in context.write_set().written() {
            let kind = &assignment.kinds[&key.region];
            plan.push(PlannedWrite {
                key: key.clone(),
                entry: Arc::clone(&reserved[key]),
                operation: write.operation().unwrap_or(Operation::Update),
                value: write.new_value().cloned(),
                persistent: kind.is_persistent(),
                replicas: kind.replica_targets(self.store.as_ref(), &key.region, &key.key, host)?,
                noop: write.is_noop(),
            });
        }

        log::debug!(
            "{} reserved {} keys on {}",
            id,
            reservation.len(),
            host
        );
        Ok(PreparedCommit {
            context,
            host,
            plan,
            reservation,
        })
    }

    /// Apply, replicate, release, dispatch.
    pub fn complete(&self, prepared: PreparedCommit) -> Result<CommitOutcome> {
        let PreparedCommit {
            mut context,
            host,
            plan,
            reservation,
        } = prepared;
        let id = context.id();

        if let Some(sink) = &self.persistence {
            let durable: Vec<ReplicatedOp> = plan
                .iter()
                .filter(|w| w.persistent && !w.noop)
                .map(|w| ReplicatedOp {
                    region: w.key.region.clone(),
                    key: w.key.key.clone(),
                    value: w.value.clone(),
                    version: w.entry.version() + 1,
                })
                .collect();
            if !durable.is_empty() {
                if let Err(e) = sink.persist(Some(id), &durable) {
                    drop(reservation);
                    self.fail(&mut context);
                    return Err(e.into());
                }
            }
        }

        let mut events = Vec::with_capacity(plan.len());
        let mut batches: BTreeMap<MemberId, ReplicationBatch> = BTreeMap::new();
        for write in plan.iter().filter(|w| !w.noop) {
            let previous = write.entry.apply(reservation.token, write.value.clone());
            events.push(EntryEvent {
                region: write.key.region.clone(),
                key: write.key.key.clone(),
                operation: write.operation,
                old_value: previous.value,
                new_value: write.value.clone(),
                transaction: Some(id),
            });
            for member in &write.replicas {
                batches
                    .entry(*member)
                    .or_insert_with(|| ReplicationBatch::new(host, Some(id)))
                    .ops
                    .push(ReplicatedOp {
                        region: write.key.region.clone(),
                        key: write.key.key.clone(),
                        value: write.value.clone(),
                        version: previous.version + 1,
                    });
            }
        }

        let degraded_members = self.replicate(batches);
        drop(reservation);
        context.info_mut().finish(TransactionState::Committed);

        if !degraded_members.is_empty() {
            log::warn!(
                "{} committed with degraded acknowledgement from {:?}",
                id,
                degraded_members
            );
        }

        let changes = events.len();
        let dispatch_failures = self
            .dispatcher
            .after_commit(&TransactionEvent::new(id, events));

        Ok(CommitOutcome {
            id,
            host,
            changes,
            duration: context.info().duration(),
            degraded_members,
            dispatch_failures,
        })
    }

    /// Applies one write outside any transaction. Waits up to the operation
    /// timeout for the key's marker instead of failing at once, since there
    /// is no buffered state to invalidate.
    pub fn apply_single(
        &self,
        region: &str,
        key: &Bytes,
        value: Option<Bytes>,
        expect: Expect,
    ) -> Result<SingleWrite> {
        let kind = self.store.region_kind(region)?;
        let host = match kind.resolve_host(self.store.as_ref(), region, key)? {
            Host::Member(member) => member,
            Host::Any => self.store.local_member(),
        };
        if !self.distribution.is_alive(host) {
            return Err(DistributionError::MemberDeparted(host).into());
        }
        let replicas = kind.replica_targets(self.store.as_ref(), region, key, host)?;

        let entry = self.store.entry(region, key)?;
        let mut reservation = Reservation::new();
        self.await_marker(&entry, region, reservation.token)?;
        reservation.entries.push(Arc::clone(&entry));

        let current = entry.snapshot();
        expect.check(region, current.value.as_ref())?;

        let op = ReplicatedOp {
            region: region.to_string(),
            key: key.clone(),
            value: value.clone(),
            version: current.version + 1,
        };
        if let (true, Some(sink)) = (kind.is_persistent(), &self.persistence) {
            sink.persist(None, std::slice::from_ref(&op))?;
        }

        let previous = entry.apply(reservation.token, value.clone());
        let batches = replicas
            .into_iter()
            .map(|member| {
                let mut batch = ReplicationBatch::new(host, None);
                batch.ops.push(op.clone());
                (member, batch)
            })
            .collect();
        let degraded_members = self.replicate(batches);
        drop(reservation);

        let operation = match (&previous.value, &value) {
            (_, None) => Operation::Remove,
            (Some(_), Some(_)) => Operation::Update,
            (None, Some(_)) => Operation::Create,
        };
        let dispatch_failures = self.dispatcher.entry_event(&EntryEvent {
            region: region.to_string(),
            key: key.clone(),
            operation,
            old_value: previous.value.clone(),
            new_value: value,
            transaction: None,
        });

        Ok(SingleWrite {
            previous: previous.value,
            degraded_members,
            dispatch_failures,
        })
    }

    /// Sends each member its batch; returns the members that failed.
    fn replicate(&self, batches: BTreeMap<MemberId, ReplicationBatch>) -> Vec<MemberId> {
        let mut degraded = Vec::new();
        for (member, batch) in batches {
            match self
                .distribution
                .replicate(&[member], &batch, self.operation_timeout)
            {
                Ok(report) => {
                    for (failed, error) in report.failed {
                        log::warn!("replication to {} failed: {}", failed, error);
                        degraded.push(failed);
                    }
                }
                Err(error) => {
                    log::warn!("replication to {} failed: {}", member, error);
                    degraded.push(member);
                }
            }
        }
        degraded
    }

    /// The first strict read whose version moved, if any.
    fn invalidated_read(&self, context: &TransactionContext) -> Result<Option<ConflictReason>> {
        for (key, expected) in context.read_set().iter() {
            let actual = self.store.peek(&key.region, &key.key)?.version;
            if actual != expected {
                return Ok(Some(ConflictReason::ReadInvalidated {
                    region: key.region.clone(),
                    expected,
                    actual,
                }));
            }
        }
        Ok(None)
    }

    /// Reserves every written key in sorted order and checks its version
    /// against the baseline. On conflict the partial reservation is dropped
    /// before this returns.
    fn reserve(
        &self,
        context: &TransactionContext,
    ) -> Result<std::result::Result<Reserved, ConflictReason>> {
        let mut reservation = Reservation::new();
        let mut reserved: HashMap<EntryKey, Arc<RegionEntry>> = HashMap::new();
        for key in context.write_set().written_keys_sorted() {
            let entry = self.store.entry(&key.region, &key.key)?;
            if !entry.try_reserve(reservation.token) {
                return Ok(Err(ConflictReason::KeyReserved {
                    region: key.region.clone(),
                }));
            }
            reservation.entries.push(Arc::clone(&entry));
            self.stats.markers_placed(1);

            let expected = context
                .write_set()
                .get(key)
                .map(|e| e.baseline_version())
                .unwrap_or_default();
            let actual = entry.version();
            if actual != expected {
                return Ok(Err(ConflictReason::VersionChanged {
                    region: key.region.clone(),
                    expected,
                    actual,
                }));
            }
            reserved.insert(key.clone(), entry);
        }
        Ok(Ok((reservation, reserved)))
    }

    /// Spins briefly, then sleeps, until the marker is ours or the operation
    /// timeout passes.
    fn await_marker(
        &self,
        entry: &RegionEntry,
        region: &str,
        token: ReservationToken,
    ) -> Result<()> {
        let start = Instant::now();
        let mut attempts = 0u32;
        while !entry.try_reserve(token) {
            if start.elapsed() > self.operation_timeout {
                self.stats.reservation_timeout();
                log::warn!(
                    "gave up waiting {:?} for a marker in region '{}' held by {:?}",
                    self.operation_timeout,
                    region,
                    entry.reserved_by()
                );
                return Err(TransactionError::ReservationTimeout {
                    region: region.to_string(),
                    timeout: self.operation_timeout,
                });
            }
            attempts += 1;
            if attempts < SPIN_ATTEMPTS {
                thread::yield_now();
            } else {
                thread::sleep(MARKER_BACKOFF);
            }
        }
        Ok(())
    }

    fn conflict(
        &self,
        context: &mut TransactionContext,
        reason: ConflictReason,
    ) -> TransactionError {
        log::debug!("{} conflicted: {}", context.id(), reason);
        self.fail(context);
        TransactionError::CommitConflict {
            id: context.id(),
            reason,
        }
    }

    /// Marks a commit that applied nothing and tells the listeners. Their
    /// failures are logged by the dispatcher and not returned.
    fn fail(&self, context: &mut TransactionContext) {
        context.info_mut().finish(TransactionState::Conflicted);
        let failures = self.dispatcher.after_failed_commit(&pending_event(context));
        if !failures.is_empty() {
            log::debug!(
                "{} failed-commit listeners reported {} errors",
                context.id(),
                failures.len()
            );
        }
    }
}
