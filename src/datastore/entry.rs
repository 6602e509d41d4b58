//! Datastore entries
//!
//! A [`DatastoreEntry`] is one watchable value: a device variable or an alias
//! pointing at one. Entries are owned by the [`Datastore`](super::Datastore)
//! and handed out by reference only.

use crate::types::{EntryId, VariableDescription, WatchableType, WatchableValue};
use chrono::{DateTime, Utc};
use std::fmt;

/// Stable token identifying whoever watches an entry (a client connection,
/// the device updater, a test). At most one observer per owner per entry.
pub type OwnerId = u64;

/// Receiver of value-change notifications
pub trait EntryObserver: Send {
    /// Called with the entry right after its value changed
    fn notify(&mut self, entry: &DatastoreEntry);
}

impl<F> EntryObserver for F
where
    F: FnMut(&DatastoreEntry) + Send,
{
    fn notify(&mut self, entry: &DatastoreEntry) {
        self(entry)
    }
}

/// What an entry refers to
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// Variable in device memory
    Variable(VariableDescription),
    /// Alias of a variable entry
    Alias { target: EntryId },
}

impl EntryKind {
    pub fn watchable_type(&self) -> WatchableType {
        match self {
            EntryKind::Variable(_) => WatchableType::Variable,
            EntryKind::Alias { .. } => WatchableType::Alias,
        }
    }
}

/// A client-initiated write of a new value, waiting for the device
#[derive(Debug, Clone, PartialEq)]
pub struct TargetUpdateRequest {
    pub value: WatchableValue,
    pub request_time: DateTime<Utc>,
    pub completed: bool,
    pub success: bool,
    pub completion_time: Option<DateTime<Utc>>,
}

impl TargetUpdateRequest {
    pub fn new(value: WatchableValue) -> Self {
        Self {
            value,
            request_time: Utc::now(),
            completed: false,
            success: false,
            completion_time: None,
        }
    }

    pub fn complete(&mut self, success: bool) {
        self.completed = true;
        self.success = success;
        self.completion_time = Some(Utc::now());
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn is_success(&self) -> bool {
        self.completed && self.success
    }
}

/// One watchable entry
pub struct DatastoreEntry {
    id: EntryId,
    kind: EntryKind,
    display_path: String,
    value: Option<WatchableValue>,
    last_update_time: Option<DateTime<Utc>>,
    dirty: bool,
    /// Observers in registration order. A slot is empty only while its
    /// observer is being notified.
    observers: Vec<(OwnerId, Option<Box<dyn EntryObserver>>)>,
    callback_pending: bool,
    target_update: Option<TargetUpdateRequest>,
}

impl DatastoreEntry {
    /// Create a variable entry
    pub fn variable(id: EntryId, display_path: impl Into<String>, desc: VariableDescription) -> Self {
        Self::new(id, EntryKind::Variable(desc), display_path.into())
    }

    /// Create an alias of the variable entry `target`
    pub fn alias(id: EntryId, display_path: impl Into<String>, target: EntryId) -> Self {
        Self::new(id, EntryKind::Alias { target }, display_path.into())
    }

    fn new(id: EntryId, kind: EntryKind, display_path: String) -> Self {
        Self {
            id,
            kind,
            display_path,
            value: None,
            last_update_time: None,
            dirty: false,
            observers: Vec::new(),
            callback_pending: false,
            target_update: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    pub fn watchable_type(&self) -> WatchableType {
        self.kind.watchable_type()
    }

    pub fn display_path(&self) -> &str {
        &self.display_path
    }

    /// Description of the underlying variable, `None` for aliases
    pub fn variable_description(&self) -> Option<&VariableDescription> {
        match &self.kind {
            EntryKind::Variable(desc) => Some(desc),
            EntryKind::Alias { .. } => None,
        }
    }

    /// Referenced variable, `None` for variables
    pub fn alias_target(&self) -> Option<EntryId> {
        match self.kind {
            EntryKind::Alias { target } => Some(target),
            EntryKind::Variable(_) => None,
        }
    }

    pub fn value(&self) -> Option<&WatchableValue> {
        self.value.as_ref()
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.last_update_time
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True while at least one owner observes the entry
    pub fn is_watched(&self) -> bool {
        !self.observers.is_empty()
    }

    /// True while observers are being notified
    pub fn is_callback_pending(&self) -> bool {
        self.callback_pending
    }

    pub fn has_owner(&self, owner: OwnerId) -> bool {
        self.observers.iter().any(|(o, _)| *o == owner)
    }

    /// Owners in registration order
    pub fn owners(&self) -> Vec<OwnerId> {
        self.observers.iter().map(|(o, _)| *o).collect()
    }

    pub fn target_update(&self) -> Option<&TargetUpdateRequest> {
        self.target_update.as_ref()
    }

    /// True if a target update is waiting for the device
    pub fn has_pending_target_update(&self) -> bool {
        self.target_update.as_ref().is_some_and(|t| !t.completed)
    }

    // ==================== Mutation (datastore only) ====================

    /// Register `observer` for `owner`, replacing the owner's previous one in place
    pub(super) fn set_observer(&mut self, owner: OwnerId, observer: Box<dyn EntryObserver>) {
        match self.observers.iter_mut().find(|(o, _)| *o == owner) {
            Some(slot) => slot.1 = Some(observer),
            None => self.observers.push((owner, Some(observer))),
        }
    }

    /// Remove the owner's observer; returns whether one was registered
    pub(super) fn remove_observer(&mut self, owner: OwnerId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(o, _)| *o != owner);
        self.observers.len() != before
    }

    pub(super) fn clear_observers(&mut self) {
        self.observers.clear();
    }

    /// Store a new value and notify every observer in registration order
    pub(super) fn set_value(&mut self, value: WatchableValue) {
        self.value = Some(value);
        self.last_update_time = Some(Utc::now());
        self.dirty = true;

        if self.observers.is_empty() {
            return;
        }

        self.callback_pending = true;
        for index in 0..self.observers.len() {
            // Owners stay registered while their callback is out of its slot
            if let Some(mut observer) = self.observers[index].1.take() {
                observer.notify(self);
                self.observers[index].1 = Some(observer);
            }
        }
        self.callback_pending = false;
    }

    pub(super) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(super) fn request_target_update(&mut self, value: WatchableValue) {
        self.target_update = Some(TargetUpdateRequest::new(value));
    }

    pub(super) fn complete_target_update(&mut self, success: bool) -> bool {
        match self.target_update.as_mut() {
            Some(update) if !update.completed => {
                update.complete(success);
                true
            }
            _ => false,
        }
    }

    pub(super) fn discard_target_update(&mut self) -> Option<TargetUpdateRequest> {
        self.target_update.take()
    }
}

impl fmt::Debug for DatastoreEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("display_path", &self.display_path)
            .field("value", &self.value)
            .field("dirty", &self.dirty)
            .field("owners", &self.owners())
            .field("target_update", &self.target_update)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VariableType;
    use std::sync::{Arc, Mutex};

    fn var(id: u32) -> DatastoreEntry {
        DatastoreEntry::variable(
            EntryId(id),
            format!("/var/v{}", id),
            VariableDescription::new(0x1000, VariableType::U16),
        )
    }

    #[test]
    fn test_new_entry_state() {
        let e = var(3);
        assert_eq!(e.id(), EntryId(3));
        assert_eq!(e.watchable_type(), WatchableType::Variable);
        assert!(e.value().is_none());
        assert!(!e.is_dirty());
        assert!(!e.is_watched());
        assert!(e.variable_description().is_some());
        assert!(e.alias_target().is_none());

        let a = DatastoreEntry::alias(EntryId(4), "/alias/a", EntryId(3));
        assert_eq!(a.watchable_type(), WatchableType::Alias);
        assert_eq!(a.alias_target(), Some(EntryId(3)));
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut e = var(1);
        for owner in [30u64, 10, 20] {
            let log = log.clone();
            e.set_observer(
                owner,
                Box::new(move |entry: &DatastoreEntry| {
                    assert!(entry.is_callback_pending());
                    log.lock().unwrap().push(owner);
                }),
            );
        }

        e.set_value(WatchableValue::Int(5));
        assert_eq!(*log.lock().unwrap(), vec![30, 10, 20]);
        assert!(!e.is_callback_pending());
        assert!(e.is_dirty());
        assert!(e.last_update_time().is_some());
    }

    #[test]
    fn test_owners_visible_during_notification() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut e = var(1);
        for owner in [7u64, 8] {
            let seen = seen.clone();
            e.set_observer(
                owner,
                Box::new(move |entry: &DatastoreEntry| {
                    seen.lock()
                        .unwrap()
                        .push((entry.is_watched(), entry.has_owner(owner), entry.owners()));
                }),
            );
        }

        e.set_value(WatchableValue::Int(1));
        for (watched, own, owners) in seen.lock().unwrap().iter() {
            assert!(*watched);
            assert!(*own);
            assert_eq!(owners, &vec![7, 8]);
        }
        assert_eq!(e.owners(), vec![7, 8]);

        // Observers survive the fan-out and run again on the next value
        e.set_value(WatchableValue::Int(2));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_replacing_observer_keeps_position() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut e = var(1);
        for (owner, tag) in [(1u64, "a"), (2, "b"), (1, "c")] {
            let log = log.clone();
            e.set_observer(
                owner,
                Box::new(move |_: &DatastoreEntry| log.lock().unwrap().push(tag)),
            );
        }
        assert_eq!(e.owners(), vec![1, 2]);
        e.set_value(WatchableValue::Int(0));
        assert_eq!(*log.lock().unwrap(), vec!["c", "b"]);
    }

    #[test]
    fn test_target_update_lifecycle() {
        let mut e = var(1);
        assert!(!e.has_pending_target_update());
        e.request_target_update(WatchableValue::Int(7));
        assert!(e.has_pending_target_update());

        assert!(e.complete_target_update(true));
        assert!(!e.has_pending_target_update());
        assert!(e.target_update().unwrap().is_success());
        // Already complete
        assert!(!e.complete_target_update(false));

        assert!(e.discard_target_update().is_some());
        assert!(e.target_update().is_none());
    }
}
