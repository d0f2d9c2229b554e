//! The per-transaction context: identity, buffers and lifecycle state.

use bytes::Bytes;

use super::error::Result;
use super::id::TransactionId;
use super::read_set::ReadSet;
use super::state::TransactionInfo;
use super::write_set::{EntryKey, Expect, WriteSet};
use crate::distribution::MemberId;
use crate::region::RegionStore;

/// Everything a transaction owns between begin and commit or rollback.
///
/// Reads and writes against a context never touch the store except to take
/// the first-touch snapshot of a key.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    info: TransactionInfo,
    strict: bool,
    write_set: WriteSet,
    read_set: ReadSet,
    host: Option<MemberId>,
}

impl TransactionContext {
    pub fn new(id: TransactionId, strict: bool) -> Self {
        Self {
            info: TransactionInfo::new(id),
            strict,
            write_set: WriteSet::new(),
            read_set: ReadSet::new(),
            host: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.info.id
    }

    pub fn info(&self) -> &TransactionInfo {
        &self.info
    }

    pub(crate) fn info_mut(&mut self) -> &mut TransactionInfo {
        &mut self.info
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn write_set(&self) -> &WriteSet {
        &self.write_set
    }

    pub fn read_set(&self) -> &ReadSet {
        &self.read_set
    }

    /// The member chosen to run the commit, once resolved.
    pub fn host(&self) -> Option<MemberId> {
        self.host
    }

    pub(crate) fn set_host(&mut self, host: MemberId) {
        self.host = Some(host);
    }

    /// Transactional read: own writes first, then the first-touch snapshot.
    pub fn read(
        &mut self,
        store: &dyn RegionStore,
        region: &str,
        key: &Bytes,
    ) -> Result<Option<Bytes>> {
        let entry_key = EntryKey::new(region, key.clone());
        let entry = self
            .write_set
            .read(&entry_key, || store.peek(region, key))?;
        let value = entry.visible_value();
        if self.strict && !entry.is_written() {
            self.read_set.record(&entry_key, entry.baseline_version());
        }
        Ok(value)
    }

    /// Buffers a write (`None` removes) and returns the previously visible
    /// value. `expect` is checked against the transaction's own view of the
    /// key; a failed check buffers nothing.
    pub fn write(
        &mut self,
        store: &dyn RegionStore,
        region: &str,
        key: Bytes,
        value: Option<Bytes>,
        expect: Expect,
    ) -> Result<Option<Bytes>> {
        let entry_key = EntryKey::new(region, key.clone());
        let current = self
            .write_set
            .read(&entry_key, || store.peek(region, &key))?
            .visible_value();
        expect.check(region, current.as_ref())?;

        self.write_set
            .write(entry_key.clone(), value, || store.peek(region, &key))?;
        self.read_set.forget(&entry_key);
        Ok(current)
    }
}
