//! The buffer registry.

use super::object::{BufferId, MemObject};
use crate::error::{Error, Result};
use crate::kernel::KernelId;
use crate::util::slab::Slab;
use parking_lot::{Mutex, MutexGuard};

/// Every live memory object of one runtime.
///
/// Callers that also need the kernel registry take it first.
#[derive(Debug, Default)]
pub(crate) struct MemoryModel {
    objects: Mutex<Slab<MemObject>>,
}

pub(crate) type Objects<'a> = MutexGuard<'a, Slab<MemObject>>;

impl MemoryModel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> Objects<'_> {
        self.objects.lock()
    }

    pub(crate) fn insert(&self, object: MemObject) -> BufferId {
        BufferId(self.objects.lock().insert(object))
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub(crate) fn ids(&self) -> Vec<BufferId> {
        self.objects.lock().keys().into_iter().map(BufferId).collect()
    }

    /// Run `f` on one object.
    pub(crate) fn with<R>(&self, id: BufferId, f: impl FnOnce(&MemObject) -> R) -> Result<R> {
        let objects = self.objects.lock();
        objects.get(id.0).map(f).ok_or(Error::InvalidHandle("buffer"))
    }

    pub(crate) fn with_mut<R>(
        &self,
        id: BufferId,
        f: impl FnOnce(&mut MemObject) -> R,
    ) -> Result<R> {
        let mut objects = self.objects.lock();
        objects.get_mut(id.0).map(f).ok_or(Error::InvalidHandle("buffer"))
    }

    /// Drop every association with `kernel`.
    pub(crate) fn dissociate_kernel_everywhere(&self, kernel: KernelId) {
        for (_, object) in self.objects.lock().iter_mut() {
            object.kernels.remove(&kernel);
        }
    }
}

/// Lookup helpers on a held guard.
pub(crate) fn get<'a>(objects: &'a Objects<'_>, id: BufferId) -> Result<&'a MemObject> {
    objects.get(id.0).ok_or(Error::InvalidHandle("buffer"))
}

pub(crate) fn get_mut<'a>(objects: &'a mut Objects<'_>, id: BufferId) -> Result<&'a mut MemObject> {
    objects.get_mut(id.0).ok_or(Error::InvalidHandle("buffer"))
}
