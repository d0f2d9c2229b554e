//! Versioned region entries and their reservation markers.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Marker value meaning "not reserved".
const FREE: u64 = 0;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// The identity stamped into a reservation marker by its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationToken(u64);

impl ReservationToken {
    /// Allocates a token that no other holder will ever use.
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value stored in a marker.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A value together with the version it was read or written at.
///
/// `value == None` with a non-zero version is a tombstone left by a removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Option<Bytes>,
    pub version: u64,
}

impl VersionedValue {
    /// Creates a value at `version`.
    pub fn new(value: Option<Bytes>, version: u64) -> Self {
        Self { value, version }
    }
}

/// One key's slot in a region: current value, version counter and the
/// reservation marker, kept side by side.
#[derive(Debug, Default)]
pub struct RegionEntry {
    marker: AtomicU64,
    slot: RwLock<VersionedValue>,
}

impl RegionEntry {
    /// Creates an absent, unreserved entry at version zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of value and version. Never observes a half-applied
    /// write.
    pub fn snapshot(&self) -> VersionedValue {
        self.slot.read().clone()
    }

    /// Returns the current version.
    pub fn version(&self) -> u64 {
        self.slot.read().version
    }

    /// Places `token` on the entry if nobody else holds it.
    pub fn try_reserve(&self, token: ReservationToken) -> bool {
        self.marker
            .compare_exchange(FREE, token.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears the marker if `token` holds it.
    pub fn release(&self, token: ReservationToken) -> bool {
        self.marker
            .compare_exchange(token.0, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns the token holding the marker, if any.
    pub fn reserved_by(&self) -> Option<ReservationToken> {
        match self.marker.load(Ordering::Acquire) {
            FREE => None,
            token => Some(ReservationToken(token)),
        }
    }

    /// Returns true if any token holds the marker.
    pub fn is_reserved(&self) -> bool {
        self.reserved_by().is_some()
    }

    /// Installs `value` and bumps the version. The caller must hold the
    /// reservation; returns the previous contents.
    pub fn apply(&self, token: ReservationToken, value: Option<Bytes>) -> VersionedValue {
        debug_assert_eq!(self.reserved_by(), Some(token));
        let mut slot = self.slot.write();
        let previous = slot.clone();
        slot.value = value;
        slot.version += 1;
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_exclusive() {
        let entry = RegionEntry::new();
        let t1 = ReservationToken::next();
        let t2 = ReservationToken::next();

        assert!(entry.try_reserve(t1));
        assert!(!entry.try_reserve(t2));
        assert_eq!(entry.reserved_by(), Some(t1));

        // Only the holder can release.
        assert!(!entry.release(t2));
        assert!(entry.release(t1));
        assert!(!entry.is_reserved());
        assert!(entry.try_reserve(t2));
    }

    #[test]
    fn test_apply_bumps_version() {
        let entry = RegionEntry::new();
        let token = ReservationToken::next();
        assert!(entry.try_reserve(token));

        let before = entry.apply(token, Some(Bytes::from("a")));
        assert_eq!(before, VersionedValue::default());

        let before = entry.apply(token, None);
        assert_eq!(before.value, Some(Bytes::from("a")));
        assert_eq!(entry.snapshot(), VersionedValue::new(None, 2));
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = ReservationToken::next();
        let b = ReservationToken::next();
        assert_ne!(a, b);
        assert_ne!(a.value(), FREE);
    }
}
