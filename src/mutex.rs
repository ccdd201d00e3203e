//! Named in-process mutex flags for cross-branch exclusion.
//!
//! A handle is a test-and-set flag, not a blocking lock: acquiring specs
//! poll it from their `update` hook and stay WAITING while it is held.
//! Scope is a single workflow instance in a single process.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MutexHandle {
    locked: AtomicBool,
}

impl MutexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically acquire the flag. Returns `true` if this call took it.
    pub fn test_and_set(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

/// Lazily creates handles by name; the same name always yields the same
/// handle.
#[derive(Debug, Default)]
pub struct MutexRegistry {
    handles: HashMap<String, Arc<MutexHandle>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, name: &str) -> Arc<MutexHandle> {
        match self.handles.entry(name.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                debug!(mutex = name, "creating mutex handle");
                Arc::clone(entry.insert(Arc::new(MutexHandle::new())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_set_is_exclusive() {
        let handle = MutexHandle::new();
        assert!(handle.test_and_set());
        assert!(!handle.test_and_set());
        assert!(handle.is_locked());
        handle.unlock();
        assert!(!handle.is_locked());
        assert!(handle.test_and_set());
    }

    #[test]
    fn registry_returns_the_same_handle_per_name() {
        let mut registry = MutexRegistry::new();
        let a = registry.get("shared");
        let b = registry.get("shared");
        let other = registry.get("other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        assert!(a.test_and_set());
        assert!(b.is_locked());
        assert!(!other.is_locked());
    }
}
