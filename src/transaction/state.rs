//! Transaction state management.

use std::time::{Duration, Instant};

use super::id::TransactionId;

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Bound to a thread and accepting operations.
    Active,
    /// Detached from any thread, waiting to be resumed.
    Suspended,
    /// Reservations are held on behalf of an external coordinator.
    Prepared,
    /// The write set has been applied.
    Committed,
    /// The commit failed; nothing was applied.
    Conflicted,
    /// The transaction was rolled back or abandoned.
    RolledBack,
}

impl TransactionState {
    /// Returns true if the transaction is bound to a thread.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if the transaction is detached by suspend.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended)
    }

    /// Returns true if the transaction reached a terminal outcome.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Conflicted | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Prepared => write!(f, "Prepared"),
            Self::Committed => write!(f, "Committed"),
            Self::Conflicted => write!(f, "Conflicted"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Lifecycle bookkeeping for a transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// The unique identifier of the transaction.
    pub id: TransactionId,
    /// The current state of the transaction.
    pub state: TransactionState,
    /// When the transaction began.
    pub start_time: Instant,
    /// When the transaction was last suspended, if it is suspended.
    pub suspended_at: Option<Instant>,
    /// When the transaction finished.
    pub end_time: Option<Instant>,
}

impl TransactionInfo {
    /// Creates info for a freshly begun transaction.
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            start_time: Instant::now(),
            suspended_at: None,
            end_time: None,
        }
    }

    /// Returns how long the transaction has been (or was) running.
    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Returns how long the transaction has been suspended.
    pub fn suspended_for(&self) -> Option<Duration> {
        self.suspended_at.map(|at| at.elapsed())
    }

    pub fn suspend(&mut self) {
        debug_assert!(self.state.is_active());
        self.state = TransactionState::Suspended;
        self.suspended_at = Some(Instant::now());
    }

    pub fn resume(&mut self) {
        debug_assert!(self.state.is_suspended());
        self.state = TransactionState::Active;
        self.suspended_at = None;
    }

    pub fn prepare(&mut self) {
        self.state = TransactionState::Prepared;
    }

    /// Moves the transaction into a terminal state.
    pub fn finish(&mut self, state: TransactionState) {
        debug_assert!(state.is_finished());
        self.state = state;
        self.suspended_at = None;
        self.end_time = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::MemberId;

    fn info() -> TransactionInfo {
        TransactionInfo::new(TransactionId::new(MemberId::new(1), 1))
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Active.is_finished());
        assert!(TransactionState::Suspended.is_suspended());
        assert!(!TransactionState::Prepared.is_finished());
        assert!(TransactionState::Committed.is_finished());
        assert!(TransactionState::Conflicted.is_finished());
        assert!(TransactionState::RolledBack.is_finished());
    }

    #[test]
    fn test_transaction_state_display() {
        assert_eq!(format!("{}", TransactionState::Active), "Active");
        assert_eq!(format!("{}", TransactionState::RolledBack), "RolledBack");
    }

    #[test]
    fn test_transaction_info_suspend_resume() {
        let mut info = info();

        info.suspend();
        assert_eq!(info.state, TransactionState::Suspended);
        assert!(info.suspended_for().is_some());

        info.resume();
        assert_eq!(info.state, TransactionState::Active);
        assert!(info.suspended_for().is_none());
    }

    #[test]
    fn test_transaction_info_duration_fixed_after_finish() {
        let mut info = info();
        std::thread::sleep(Duration::from_millis(5));

        info.finish(TransactionState::Committed);
        let d1 = info.duration();
        std::thread::sleep(Duration::from_millis(5));
        let d2 = info.duration();

        assert!(d1 >= Duration::from_millis(5));
        assert_eq!(d1, d2);
        assert!(info.end_time.is_some());
    }
}
