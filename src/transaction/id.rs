//! Transaction ID generation and management.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::distribution::MemberId;

/// A grid-wide unique identifier for a transaction.
///
/// The originating member is part of the identity, so two members can hand out
/// the same sequence number without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    member: MemberId,
    sequence: u64,
}

impl TransactionId {
    /// Creates a new transaction ID with the given member and sequence.
    pub fn new(member: MemberId, sequence: u64) -> Self {
        Self { member, sequence }
    }

    /// The member that began the transaction.
    pub fn member(&self) -> MemberId {
        self.member
    }

    /// The per-member sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TX[{}:{}]", self.member, self.sequence)
    }
}

/// A thread-safe transaction ID generator bound to one member.
pub struct TransactionIdGenerator {
    member: MemberId,
    next_sequence: AtomicU64,
}

impl TransactionIdGenerator {
    /// Creates a generator for `member` starting from sequence 1.
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Generates the next unique transaction ID.
    pub fn next(&self) -> TransactionId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        TransactionId::new(self.member, sequence)
    }

    /// Returns the most recently issued ID without incrementing.
    pub fn current(&self) -> TransactionId {
        let sequence = self.next_sequence.load(Ordering::SeqCst);
        TransactionId::new(self.member, sequence.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_display() {
        let id = TransactionId::new(MemberId::new(3), 123);
        assert_eq!(format!("{}", id), "TX[member-3:123]");
    }

    #[test]
    fn test_transaction_id_distinct_members() {
        let a = TransactionId::new(MemberId::new(1), 7);
        let b = TransactionId::new(MemberId::new(2), 7);

        assert_ne!(a, b);
        assert_eq!(a.sequence(), b.sequence());
    }

    #[test]
    fn test_transaction_id_generator() {
        let generator = TransactionIdGenerator::new(MemberId::new(1));

        assert_eq!(generator.current().sequence(), 0);

        let id1 = generator.next();
        let id2 = generator.next();

        assert_eq!(id1.sequence(), 1);
        assert_eq!(id2.sequence(), 2);
        assert_eq!(id2.member(), MemberId::new(1));
        assert_eq!(generator.current(), id2);
    }

    #[test]
    fn test_transaction_id_generator_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(TransactionIdGenerator::new(MemberId::new(9)));
        let mut handles = vec![];

        for _ in 0..10 {
            let gen = Arc::clone(&generator);
            handles.push(thread::spawn(move || {
                (0..100).map(|_| gen.next()).collect::<Vec<_>>()
            }));
        }

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        let mut unique_ids = all_ids.clone();
        unique_ids.sort();
        unique_ids.dedup();

        assert_eq!(all_ids.len(), 1000);
        assert_eq!(unique_ids.len(), 1000);
    }
}
