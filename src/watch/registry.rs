//! Lock-guarded map of active watchers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::error;

use super::watcher::{Watcher, WatcherId};

/// Map from watcher id to watcher.
///
/// Iteration happens on a copied snapshot so the lock is never held across a
/// poll or a callback. Ids are issued in increasing order, so snapshot order
/// is registration order.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    entries: Mutex<BTreeMap<WatcherId, Arc<Watcher>>>,
}

impl WatchRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<WatcherId, Arc<Watcher>>> {
        // Entries are plain Arcs; a panic elsewhere cannot leave them half-written.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a watcher. Returns false, leaving the registry unchanged, if the id
    /// is already present.
    pub fn insert(&self, watcher: Arc<Watcher>) -> bool {
        let id = watcher.id();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            drop(entries);
            error!(watcher_id = %id, "duplicate watcher id rejected by registry");
            debug_assert!(false, "duplicate watcher id {id}");
            return false;
        }
        entries.insert(id, watcher);
        true
    }

    /// Remove a watcher, handing it back so the caller can close it.
    pub fn remove(&self, id: WatcherId) -> Option<Arc<Watcher>> {
        self.lock().remove(&id)
    }

    /// Point-in-time copy of the entries in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Watcher>> {
        self.lock().values().cloned().collect()
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<Arc<Watcher>> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: WatcherId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Registered ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<WatcherId> {
        self.lock().keys().copied().collect()
    }

    /// Number of registered watchers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no watcher is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
