//! A thread-safe in-memory holder for the currently active flag set.
//! [`FlagStore`] provides concurrent access for readers (flag evaluation) and
//! writers (sync connectors).
use std::sync::{Arc, RwLock};

use crate::flagset::FlagSet;

/// `FlagStore` holds exactly one [`FlagSet`] reference at a time.
///
/// A `FlagSet` is immutable and only ever replaced completely, so readers get
/// a snapshot `Arc` that is unaffected by concurrent replacements; an
/// evaluation that started against one snapshot finishes against it.
#[derive(Default)]
pub struct FlagStore {
    current: RwLock<Arc<FlagSet>>,
}

impl FlagStore {
    /// Create a store holding an empty flag set.
    pub fn new() -> FlagStore {
        FlagStore::default()
    }

    /// Get the currently-active flag set snapshot.
    pub fn snapshot(&self) -> Arc<FlagSet> {
        // Err() is possible only if the lock is poisoned (writer panicked
        // while holding the lock), which should never happen.
        let current = self
            .current
            .read()
            .expect("thread holding flag set lock should not panic");
        current.clone()
    }

    /// Atomically replace the current flag set.
    ///
    /// Returns the keys that were added, removed or changed relative to the
    /// previous snapshot, for the configuration-changed event. A structurally
    /// identical replacement yields an empty list.
    pub fn replace(&self, next: Arc<FlagSet>) -> Vec<String> {
        let mut current = self
            .current
            .write()
            .expect("thread holding flag set lock should not panic");
        let changed = current.changed_keys(&next);
        *current = next;
        changed
    }
}
