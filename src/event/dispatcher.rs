//! Callback registration and delivery.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

use super::{
    CallbackError, EntryEvent, EntryListener, TransactionEvent, TransactionListener,
    TransactionWriter,
};

/// Which callback failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackKind {
    EntryListener { region: String },
    TransactionListener,
}

/// A listener failure reported back to the committing caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub callback: CallbackKind,
    pub error: CallbackError,
}

/// Holds the registered callbacks and delivers events to them.
#[derive(Default)]
pub struct EventDispatcher {
    writer: RwLock<Option<Arc<dyn TransactionWriter>>>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
    entry_listeners: DashMap<String, Vec<Arc<dyn EntryListener>>>,
}

impl EventDispatcher {
    /// Creates a dispatcher with no writer and no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the transaction writer, replacing and returning any previous
    /// one.
    pub fn set_writer(
        &self,
        writer: Option<Arc<dyn TransactionWriter>>,
    ) -> Option<Arc<dyn TransactionWriter>> {
        std::mem::replace(&mut *self.writer.write(), writer)
    }

    /// Returns the installed writer, if any.
    pub fn writer(&self) -> Option<Arc<dyn TransactionWriter>> {
        self.writer.read().clone()
    }

    /// Registers a transaction listener. Listeners run in registration order.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.write().push(listener);
    }

    /// Unregisters a listener by identity. Returns false if it was not
    /// registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Returns a copy of the registered listeners.
    pub fn listeners(&self) -> Vec<Arc<dyn TransactionListener>> {
        self.listeners.read().clone()
    }

    /// Registers a listener for the entry events of one region.
    pub fn add_entry_listener(&self, region: &str, listener: Arc<dyn EntryListener>) {
        self.entry_listeners
            .entry(region.to_string())
            .or_default()
            .push(listener);
    }

    /// Unregisters a region's entry listener by identity.
    pub fn remove_entry_listener(&self, region: &str, listener: &Arc<dyn EntryListener>) -> bool {
        match self.entry_listeners.get_mut(region) {
            Some(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|l| !Arc::ptr_eq(l, listener));
                listeners.len() != before
            }
            None => false,
        }
    }

    /// Gives the writer its chance to veto. No writer means no veto.
    pub fn before_commit(&self, event: &TransactionEvent) -> Result<(), CallbackError> {
        match self.writer() {
            Some(writer) => writer.before_commit(event),
            None => Ok(()),
        }
    }

    /// Per-key events first, then the aggregate event.
    pub fn after_commit(&self, event: &TransactionEvent) -> Vec<DispatchFailure> {
        let mut failures = Vec::new();
        for entry_event in &event.events {
            failures.extend(self.entry_event(entry_event));
        }
        for listener in self.listeners() {
            if let Err(error) = listener.after_commit(event) {
                failures.push(Self::listener_failure(error));
            }
        }
        failures
    }

    /// Tells the listeners a commit applied nothing.
    ///
    /// Every failure is logged here. The coordinator does not surface the
    /// returned list, because the caller already receives the commit error.
    pub fn after_failed_commit(&self, event: &TransactionEvent) -> Vec<DispatchFailure> {
        self.listeners()
            .iter()
            .filter_map(|l| l.after_failed_commit(event).err())
            .map(Self::listener_failure)
            .collect()
    }

    /// Tells the listeners a transaction was discarded.
    ///
    /// Every failure is logged here. A rollback cannot fail, so the manager
    /// does not surface the returned list.
    pub fn after_rollback(&self, event: &TransactionEvent) -> Vec<DispatchFailure> {
        self.listeners()
            .iter()
            .filter_map(|l| l.after_rollback(event).err())
            .map(Self::listener_failure)
            .collect()
    }

    /// Delivers one event to the listeners of its region.
    pub fn entry_event(&self, event: &EntryEvent) -> Vec<DispatchFailure> {
        let listeners = match self.entry_listeners.get(&event.region) {
            Some(listeners) => listeners.value().clone(),
            None => return Vec::new(),
        };
        listeners
            .iter()
            .filter_map(|l| l.on_event(event).err())
            .map(|error| {
                log::warn!(
                    "entry listener on region '{}' failed: {}",
                    event.region,
                    error
                );
                DispatchFailure {
                    callback: CallbackKind::EntryListener {
                        region: event.region.clone(),
                    },
                    error,
                }
            })
            .collect()
    }

    fn listener_failure(error: CallbackError) -> DispatchFailure {
        log::warn!("transaction listener failed: {}", error);
        DispatchFailure {
            callback: CallbackKind::TransactionListener,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::MemberId;
    use crate::event::CallbackResult;
    use crate::transaction::{Operation, TransactionId};
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn push(&self, what: String) -> CallbackResult {
            self.seen.lock().push(what);
            if self.fail {
                Err(CallbackError::new("listener broke"))
            } else {
                Ok(())
            }
        }
    }

    impl EntryListener for Recorder {
        fn on_event(&self, event: &EntryEvent) -> CallbackResult {
            self.push(format!("entry:{:?}", event.key))
        }
    }

    impl TransactionListener for Recorder {
        fn after_commit(&self, event: &TransactionEvent) -> CallbackResult {
            self.push(format!("commit:{}", event.events.len()))
        }

        fn after_rollback(&self, _event: &TransactionEvent) -> CallbackResult {
            self.push("rollback".to_string())
        }
    }

    struct Veto;

    impl TransactionWriter for Veto {
        fn before_commit(&self, _event: &TransactionEvent) -> CallbackResult {
            Err(CallbackError::new("not today"))
        }
    }

    fn event(keys: &[&'static str]) -> TransactionEvent {
        TransactionEvent::new(
            TransactionId::new(MemberId::new(1), 1),
            keys.iter()
                .map(|k| EntryEvent {
                    region: "r".to_string(),
                    key: Bytes::from(*k),
                    operation: Operation::Create,
                    old_value: None,
                    new_value: Some(Bytes::from("v")),
                    transaction: None,
                })
                .collect(),
        )
    }

    #[test]
    fn test_writer_veto_and_replacement() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher.before_commit(&event(&["a"])).is_ok());

        assert!(dispatcher.set_writer(Some(Arc::new(Veto))).is_none());
        let err = dispatcher.before_commit(&event(&["a"])).unwrap_err();
        assert_eq!(err.message(), "not today");

        assert!(dispatcher.set_writer(None).is_some());
        assert!(dispatcher.writer().is_none());
    }

    #[test]
    fn test_entry_events_precede_transaction_event() {
        let dispatcher = EventDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.add_entry_listener("r", recorder.clone());
        dispatcher.add_listener(recorder.clone());

        let failures = dispatcher.after_commit(&event(&["a", "b"]));
        assert!(failures.is_empty());
        assert_eq!(
            *recorder.seen.lock(),
            vec!["entry:b\"a\"", "entry:b\"b\"", "commit:2"]
        );
    }

    #[test]
    fn test_failures_are_collected() {
        let dispatcher = EventDispatcher::new();
        let broken = Arc::new(Recorder::failing());
        dispatcher.add_entry_listener("r", broken.clone());
        dispatcher.add_listener(broken.clone());

        let failures = dispatcher.after_commit(&event(&["a"]));
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[0].callback,
            CallbackKind::EntryListener {
                region: "r".to_string()
            }
        );
        assert_eq!(failures[1].callback, CallbackKind::TransactionListener);

        let failures = dispatcher.after_rollback(&event(&["a"]));
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_remove_listeners() {
        let dispatcher = EventDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn TransactionListener> = recorder.clone();
        let as_entry: Arc<dyn EntryListener> = recorder.clone();

        dispatcher.add_listener(as_listener.clone());
        dispatcher.add_entry_listener("r", as_entry.clone());

        assert!(dispatcher.remove_listener(&as_listener));
        assert!(!dispatcher.remove_listener(&as_listener));
        assert!(dispatcher.remove_entry_listener("r", &as_entry));
        assert!(!dispatcher.remove_entry_listener("other", &as_entry));

        dispatcher.after_commit(&event(&["a"]));
        assert!(recorder.seen.lock().is_empty());
    }
}
