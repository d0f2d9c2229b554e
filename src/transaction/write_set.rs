//! Per-transaction buffer of pending mutations and first-touch snapshots.

use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::error::{Result, TransactionError};
use crate::region::VersionedValue;

/// A (region, key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub region: String,
    pub key: Bytes,
}

impl EntryKey {
    pub fn new(region: impl Into<String>, key: Bytes) -> Self {
        Self {
            region: region.into(),
            key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Remove,
}

impl Operation {
    fn for_write(existed: bool, value: &Option<Bytes>) -> Self {
        match (existed, value) {
            (_, None) => Self::Remove,
            (true, Some(_)) => Self::Update,
            (false, Some(_)) => Self::Create,
        }
    }
}

/// What a write expects to find before it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Absent,
    Present,
}

impl Expect {
    pub fn check(&self, region: &str, current: Option<&Bytes>) -> Result<()> {
        match (self, current) {
            (Self::Absent, Some(_)) => Err(TransactionError::EntryExists(region.to_string())),
            (Self::Present, None) => Err(TransactionError::EntryNotFound(region.to_string())),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingWrite {
    operation: Operation,
    value: Option<Bytes>,
}

/// State of one key inside a transaction.
///
/// The baseline is fixed at first touch, whether that was a read or a write.
/// An entry without a pending write only serves repeatable reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSetEntry {
    baseline_version: u64,
    original_value: Option<Bytes>,
    pending: Option<PendingWrite>,
}

impl WriteSetEntry {
    fn from_snapshot(snapshot: VersionedValue) -> Self {
        Self {
            baseline_version: snapshot.version,
            original_value: snapshot.value,
            pending: None,
        }
    }

    pub fn baseline_version(&self) -> u64 {
        self.baseline_version
    }

    /// The value seen at first touch.
    pub fn original_value(&self) -> Option<&Bytes> {
        self.original_value.as_ref()
    }

    pub fn operation(&self) -> Option<Operation> {
        self.pending.as_ref().map(|p| p.operation)
    }

    pub fn new_value(&self) -> Option<&Bytes> {
        self.pending.as_ref().and_then(|p| p.value.as_ref())
    }

    pub fn is_written(&self) -> bool {
        self.pending.is_some()
    }

    /// What a read inside the transaction returns.
    pub fn visible_value(&self) -> Option<Bytes> {
        match &self.pending {
            Some(p) => p.value.clone(),
            None => self.original_value.clone(),
        }
    }

    /// A key that did not exist and is removed again has no net effect.
    pub fn is_noop(&self) -> bool {
        matches!(
            &self.pending,
            Some(PendingWrite { value: None, .. }) if self.original_value.is_none()
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    entries: HashMap<EntryKey, WriteSetEntry>,
    /// Written keys in the order they were first written.
    arrival: Vec<EntryKey>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntryKey) -> Option<&WriteSetEntry> {
        self.entries.get(key)
    }

    /// Returns the transaction's view of `key`, taking a snapshot through
    /// `load` on first touch.
    pub fn read<E>(
        &mut self,
        key: &EntryKey,
        load: impl FnOnce() -> std::result::Result<VersionedValue, E>,
    ) -> std::result::Result<&WriteSetEntry, E> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => Ok(e.insert(WriteSetEntry::from_snapshot(load()?))),
        }
    }

    /// Buffers `value` for `key` (`None` removes) and returns the value that
    /// was visible before.
    pub fn write<E>(
        &mut self,
        key: EntryKey,
        value: Option<Bytes>,
        load: impl FnOnce() -> std::result::Result<VersionedValue, E>,
    ) -> std::result::Result<Option<Bytes>, E> {
        let entry = match self.entries.entry(key.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(WriteSetEntry::from_snapshot(load()?)),
        };
        let previous = entry.visible_value();
        let first_write = !entry.is_written();
        entry.pending = Some(PendingWrite {
            operation: Operation::for_write(entry.original_value.is_some(), &value),
            value,
        });
        if first_write {
            self.arrival.push(key);
        }
        Ok(previous)
    }

    /// Written entries in key-arrival order.
    pub fn written(&self) -> impl Iterator<Item = (&EntryKey, &WriteSetEntry)> {
        self.arrival
            .iter()
            .filter_map(move |k| self.entries.get(k).map(|e| (k, e)))
    }

    /// Written keys in reservation order.
    pub fn written_keys_sorted(&self) -> Vec<&EntryKey> {
        let mut keys: Vec<_> = self.arrival.iter().collect();
        keys.sort();
        keys
    }

    pub fn written_len(&self) -> usize {
        self.arrival.len()
    }

    /// Keys touched by reads or writes.
    pub fn touched_len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
