//! Identifier-keyed kernel storage.

use super::{KernelId, KernelObject};
use crate::util::slab::Slab;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) kernels: Slab<KernelObject>,
    pub(crate) by_name: HashMap<String, KernelId>,
    pub(crate) current: Option<KernelId>,
}

impl RegistryState {
    pub(crate) fn get(&self, id: KernelId) -> Option<&KernelObject> {
        self.kernels.get(id.0)
    }

    pub(crate) fn get_mut(&mut self, id: KernelId) -> Option<&mut KernelObject> {
        self.kernels.get_mut(id.0)
    }

    pub(crate) fn insert(&mut self, kernel: KernelObject) -> KernelId {
        let identifier = kernel.identifier.clone();
        let id = KernelId(self.kernels.insert(kernel));
        self.by_name.insert(identifier, id);
        id
    }

    pub(crate) fn remove(&mut self, id: KernelId) -> Option<KernelObject> {
        let kernel = self.kernels.remove(id.0)?;
        if self.by_name.get(&kernel.identifier) == Some(&id) {
            self.by_name.remove(&kernel.identifier);
        }
        if self.current == Some(id) {
            self.current = None;
        }
        Some(kernel)
    }

    pub(crate) fn ids(&self) -> Vec<KernelId> {
        self.kernels.keys().into_iter().map(KernelId).collect()
    }
}

/// The kernel registry lock.
///
/// Re-entrant so compound sequences (reload, lookup-then-insert, deletion
/// with buffer cleanup) can hold it across nested calls. The state itself
/// sits in a `RefCell`: borrow it in short scopes and never across a call
/// that borrows again.
#[derive(Debug, Default)]
pub(crate) struct KernelRegistry {
    inner: ReentrantMutex<RefCell<RegistryState>>,
}

pub(crate) type RegistryGuard<'a> = ReentrantMutexGuard<'a, RefCell<RegistryState>>;

impl KernelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> RegistryGuard<'_> {
        self.inner.lock()
    }

    /// Lock and borrow for one short operation.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let guard = self.inner.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_clears_name_and_current() {
        let registry = KernelRegistry::new();
        let id = registry.with(|state| {
            let id = state.insert(KernelObject::new("k", "entry", ""));
            state.current = Some(id);
            id
        });

        // The lock is re-entrant.
        let outer = registry.lock();
        let removed = registry.with(|state| state.remove(id));
        drop(outer);

        assert!(removed.is_some());
        registry.with(|state| {
            assert!(state.by_name.is_empty());
            assert!(state.current.is_none());
            assert!(state.get(id).is_none());
        });
    }
}
