//! Versions observed by reads, kept only in strict mode.

use std::collections::HashMap;

use super::write_set::EntryKey;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSet {
    versions: HashMap<EntryKey, u64>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers the version of the first read of `key`.
    pub fn record(&mut self, key: &EntryKey, version: u64) {
        self.versions.entry(key.clone()).or_insert(version);
    }

    /// Drops `key` once it is written; the write's baseline takes over.
    pub fn forget(&mut self, key: &EntryKey) {
        self.versions.remove(key);
    }

    pub fn version(&self, key: &EntryKey) -> Option<u64> {
        self.versions.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntryKey, u64)> {
        self.versions.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
