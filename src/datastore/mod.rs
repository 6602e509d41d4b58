//! Datastore of watchable entries
//!
//! Holds every [`DatastoreEntry`] known to the session, indexed by id and by
//! type, and tracks which entries are currently watched. Value changes are
//! pushed to the entry observers synchronously, in registration order.
//!
//! The datastore itself is not synchronised. The device actor and client
//! actors share it as a [`SharedDatastore`]; every mutation happens under
//! that lock, so callback fan-out for one entry never interleaves. Observers
//! run with the datastore lock held and must not lock it again.
//!
//! # Aliases
//!
//! An alias points at a variable entry. Setting the variable value also sets
//! the value of every alias pointing at it; a target update requested on an
//! alias is recorded on its variable.

mod entry;

pub use entry::{DatastoreEntry, EntryKind, EntryObserver, OwnerId, TargetUpdateRequest};

use crate::config::DatastoreConfig;
use crate::error::{Result, TelewatchError};
use crate::types::{EntryId, IdAllocator, VariableDescription, VariableLookup, WatchableType, WatchableValue};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Datastore shared between the device actor and the client actors
pub type SharedDatastore = Arc<Mutex<Datastore>>;

/// Lock a shared datastore. A poisoned lock is recovered: entries stay
/// consistent because observers cannot reach them mutably.
pub fn lock(datastore: &SharedDatastore) -> MutexGuard<'_, Datastore> {
    datastore.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of watchable entries
pub struct Datastore {
    max_entries: usize,
    entries: HashMap<EntryId, DatastoreEntry>,
    by_type: HashMap<WatchableType, BTreeSet<EntryId>>,
    watched: BTreeSet<EntryId>,
    /// Variable id -> aliases pointing at it
    aliases_of: HashMap<EntryId, Vec<EntryId>>,
    ids: IdAllocator,
}

impl Datastore {
    /// Create an empty datastore holding at most `max_entries` entries
    pub fn new(max_entries: usize) -> Self {
        Self::with_id_allocator(max_entries, IdAllocator::default())
    }

    /// Create an empty datastore drawing entry ids from `ids`
    pub fn with_id_allocator(max_entries: usize, ids: IdAllocator) -> Self {
        Self {
            max_entries,
            entries: HashMap::new(),
            by_type: HashMap::new(),
            watched: BTreeSet::new(),
            aliases_of: HashMap::new(),
            ids,
        }
    }

    pub fn from_config(config: &DatastoreConfig) -> Self {
        Self::new(config.max_entries)
    }

    /// Wrap into a [`SharedDatastore`]
    pub fn into_shared(self) -> SharedDatastore {
        Arc::new(Mutex::new(self))
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Reserve a fresh entry id
    pub fn allocate_id(&mut self) -> EntryId {
        self.ids.allocate()
    }

    // ==================== Population ====================

    /// Add an entry.
    ///
    /// Fails with a capacity error on a duplicate id or when the datastore is
    /// full. An alias must reference an existing variable.
    pub fn add_entry(&mut self, entry: DatastoreEntry) -> Result<EntryId> {
        let id = entry.id();
        if self.entries.contains_key(&id) {
            return Err(TelewatchError::Capacity(format!("duplicate entry id {}", id)));
        }
        if self.entries.len() >= self.max_entries {
            return Err(TelewatchError::Capacity(format!(
                "datastore is full ({} entries)",
                self.max_entries
            )));
        }
        if let Some(target) = entry.alias_target() {
            match self.entries.get(&target).map(|e| e.watchable_type()) {
                Some(WatchableType::Variable) => {}
                Some(other) => {
                    return Err(TelewatchError::OutOfRange(format!(
                        "alias {} references {} entry {}, expected a variable",
                        entry.display_path(),
                        other,
                        target
                    )))
                }
                None => {
                    return Err(TelewatchError::OutOfRange(format!(
                        "alias {} references unknown entry {}",
                        entry.display_path(),
                        target
                    )))
                }
            }
            self.aliases_of.entry(target).or_default().push(id);
        }

        tracing::trace!("Datastore: added {} {} ({})", entry.watchable_type(), id, entry.display_path());
        self.by_type.entry(entry.watchable_type()).or_default().insert(id);
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Add entries, skipping those that cannot be added. Returns how many were added.
    pub fn add_entries_quiet(&mut self, entries: impl IntoIterator<Item = DatastoreEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            let path = entry.display_path().to_string();
            match self.add_entry(entry) {
                Ok(_) => added += 1,
                Err(e) => tracing::warn!("Skipping datastore entry {}: {}", path, e),
            }
        }
        added
    }

    /// Create and add a variable entry with a fresh id
    pub fn add_variable(&mut self, display_path: impl Into<String>, desc: VariableDescription) -> Result<EntryId> {
        let id = self.allocate_id();
        self.add_entry(DatastoreEntry::variable(id, display_path, desc))
    }

    /// Create and add an alias of `target` with a fresh id
    pub fn add_alias(&mut self, display_path: impl Into<String>, target: EntryId) -> Result<EntryId> {
        let id = self.allocate_id();
        self.add_entry(DatastoreEntry::alias(id, display_path, target))
    }

    /// Add one variable per path of `lookup`. Returns how many were added.
    pub fn populate(&mut self, lookup: &dyn VariableLookup) -> usize {
        let mut entries = Vec::new();
        for path in lookup.paths() {
            if let Some(desc) = lookup.lookup(&path) {
                let id = self.allocate_id();
                entries.push(DatastoreEntry::variable(id, path, desc));
            }
        }
        let added = self.add_entries_quiet(entries);
        tracing::info!("Datastore populated with {} variables", added);
        added
    }

    /// Remove every entry. Ids are not reused afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_type.clear();
        self.watched.clear();
        self.aliases_of.clear();
        tracing::debug!("Datastore cleared");
    }

    // ==================== Lookup ====================

    pub fn get_entry(&self, id: EntryId) -> Option<&DatastoreEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut DatastoreEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| TelewatchError::OutOfRange(format!("unknown entry id {}", id)))
    }

    /// Entries of one type, ordered by id
    pub fn get_entries_list_by_type(&self, watchable_type: WatchableType) -> Vec<&DatastoreEntry> {
        self.by_type
            .get(&watchable_type)
            .map(|ids| ids.iter().filter_map(|id| self.entries.get(id)).collect())
            .unwrap_or_default()
    }

    /// Every entry, grouped by type then ordered by id
    pub fn get_all_entries(&self) -> Vec<&DatastoreEntry> {
        WatchableType::all()
            .iter()
            .flat_map(|t| self.get_entries_list_by_type(*t))
            .collect()
    }

    /// Ids of the currently watched entries, ordered
    pub fn get_watched_entries(&self) -> Vec<EntryId> {
        self.watched.iter().copied().collect()
    }

    pub fn is_watched(&self, id: EntryId) -> bool {
        self.watched.contains(&id)
    }

    /// Variables the device must read: watched variables and the targets of
    /// watched aliases
    pub fn variables_to_poll(&self) -> Vec<EntryId> {
        let mut ids = BTreeSet::new();
        for id in &self.watched {
            if let Some(entry) = self.entries.get(id) {
                match entry.alias_target() {
                    Some(target) => ids.insert(target),
                    None => ids.insert(*id),
                };
            }
        }
        ids.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_by_type(&self, watchable_type: WatchableType) -> usize {
        self.by_type.get(&watchable_type).map_or(0, |ids| ids.len())
    }

    // ==================== Watching ====================

    /// Register `observer` for `owner` on entry `id`. Re-registering an owner
    /// replaces its observer.
    pub fn start_watching(
        &mut self,
        id: EntryId,
        owner: OwnerId,
        observer: impl EntryObserver + 'static,
    ) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.set_observer(owner, Box::new(observer));
        if self.watched.insert(id) {
            tracing::debug!("Datastore: entry {} now watched", id);
        }
        Ok(())
    }

    /// Remove the observer of `owner` from entry `id`. The entry leaves the
    /// watched set once its last observer is gone.
    pub fn stop_watching(&mut self, id: EntryId, owner: OwnerId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.remove_observer(owner);
        if !entry.is_watched() && self.watched.remove(&id) {
            tracing::debug!("Datastore: entry {} no longer watched", id);
        }
        Ok(())
    }

    /// Remove every observer of `owner`. Returns how many entries it watched.
    pub fn stop_watching_all(&mut self, owner: OwnerId) -> usize {
        let ids: Vec<EntryId> = self.watched.iter().copied().collect();
        let mut removed = 0;
        for id in ids {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.remove_observer(owner) {
                    removed += 1;
                }
                if !entry.is_watched() {
                    self.watched.remove(&id);
                }
            }
        }
        removed
    }

    /// Drop every observer of every entry
    pub fn stop_watching_everything(&mut self) {
        for entry in self.entries.values_mut() {
            entry.clear_observers();
        }
        self.watched.clear();
    }

    // ==================== Values ====================

    /// Store a new value, mark the entry dirty and notify its observers.
    /// A variable's aliases receive the same value.
    pub fn set_value(&mut self, id: EntryId, value: WatchableValue) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if let Some(target) = entry.alias_target() {
            return Err(TelewatchError::Api(format!(
                "entry {} is an alias of {}; set the variable instead",
                id, target
            )));
        }

        let aliases = self.aliases_of.get(&id).cloned().unwrap_or_default();
        if aliases.is_empty() {
            self.entry_mut(id)?.set_value(value);
            return Ok(());
        }

        self.entry_mut(id)?.set_value(value.clone());
        for alias in aliases {
            if let Some(entry) = self.entries.get_mut(&alias) {
                entry.set_value(value.clone());
            }
        }
        Ok(())
    }

    /// Clear the dirty flag of an entry
    pub fn mark_clean(&mut self, id: EntryId) -> Result<()> {
        self.entry_mut(id)?.mark_clean();
        Ok(())
    }

    /// Record a request to write `value` to the device. Requests on an alias
    /// land on its variable. Returns the id holding the request.
    pub fn update_target_value(&mut self, id: EntryId, value: WatchableValue) -> Result<EntryId> {
        let target = match self.entry_mut(id)?.alias_target() {
            Some(target) => target,
            None => id,
        };
        self.entry_mut(target)?.request_target_update(value);
        tracing::debug!("Datastore: target update requested on {} (via {})", target, id);
        Ok(target)
    }

    /// Entries holding a target update not yet completed, ordered by id
    pub fn pending_target_updates(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.has_pending_target_update())
            .map(|e| e.id())
            .collect();
        ids.sort();
        ids
    }

    /// Mark the pending target update of `id` as done
    pub fn mark_target_update_complete(&mut self, id: EntryId, success: bool) -> Result<()> {
        if !self.entry_mut(id)?.complete_target_update(success) {
            return Err(TelewatchError::Consistency(format!(
                "entry {} has no pending target update",
                id
            )));
        }
        if success {
            tracing::debug!("Datastore: target update on {} written", id);
        } else {
            tracing::warn!("Datastore: target update on {} failed", id);
        }
        Ok(())
    }

    /// Drop the target update of `id`, pending or completed
    pub fn discard_target_update(&mut self, id: EntryId) -> Result<Option<TargetUpdateRequest>> {
        Ok(self.entry_mut(id)?.discard_target_update())
    }
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_ENTRIES)
    }
}
