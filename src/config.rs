//! Transaction engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine-wide settings, fixed when the manager is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Validate every read at commit, not only writes.
    pub strict_reads: bool,
    /// Allow persistent regions to take part in transactions.
    pub persistent_participation: bool,
    /// Upper bound on waiting for replica acknowledgements per commit, and on
    /// a non-transactional write waiting for a reserved key.
    pub operation_timeout: Duration,
    /// Suspended transactions older than this are rolled back.
    pub suspended_timeout: Option<Duration>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            strict_reads: false,
            persistent_participation: false,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            suspended_timeout: None,
        }
    }
}

impl TransactionConfig {
    /// Returns the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether reads are validated at commit.
    pub fn with_strict_reads(mut self, strict: bool) -> Self {
        self.strict_reads = strict;
        self
    }

    /// Sets whether persistent regions may be written inside a transaction.
    pub fn with_persistent_participation(mut self, allow: bool) -> Self {
        self.persistent_participation = allow;
        self
    }

    /// Sets the replication and marker wait bound.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets how long a suspended transaction may wait for resume. `None`
    /// keeps it forever.
    pub fn with_suspended_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.suspended_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();
        assert!(!config.strict_reads);
        assert!(!config.persistent_participation);
        assert_eq!(config.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.suspended_timeout, None);
    }

    #[test]
    fn test_builder() {
        let config = TransactionConfig::new()
            .with_strict_reads(true)
            .with_operation_timeout(Duration::from_millis(250))
            .with_suspended_timeout(Some(Duration::from_secs(30)));
        assert!(config.strict_reads);
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.suspended_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_serialized_form_round_trips_through_bincode() {
        let config = TransactionConfig::new().with_persistent_participation(true);
        let bytes = bincode::serialize(&config).unwrap();
        let back: TransactionConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, config);
    }
}
