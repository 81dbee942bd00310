//! Host-side memory shared between the caller and the runtime.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;

/// A shared, growable byte block living in host memory.
///
/// Buffers keep one of these as their external data: it is the source of
/// copy-on-use writes and the sink of read-back reads. Clones share the same
/// storage, so a caller can hand one to the runtime and still observe what
/// the device wrote into it.
#[derive(Clone, Default)]
pub struct HostMemory {
    inner: Arc<RwLock<Vec<u8>>>,
}

impl HostMemory {
    /// Allocate `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Copy a slice of plain-old-data values into a new block.
    pub fn from_slice<T: bytemuck::Pod>(data: &[T]) -> Self {
        Self::from_vec(bytemuck::cast_slice(data).to_vec())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.inner.write()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.read().clone()
    }

    /// Reinterpret the contents as a vector of `T`, ignoring a trailing
    /// partial element.
    pub fn to_typed<T: bytemuck::Pod>(&self) -> Vec<T> {
        let data = self.inner.read();
        let whole = data.len() - data.len() % std::mem::size_of::<T>().max(1);
        bytemuck::pod_collect_to_vec(&data[..whole])
    }

    /// Overwrite the contents in place.
    pub fn fill_from(&self, offset: usize, src: &[u8]) -> bool {
        let mut data = self.inner.write();
        match offset.checked_add(src.len()) {
            Some(end) if end <= data.len() => {
                data[offset..end].copy_from_slice(src);
                true
            }
            _ => false,
        }
    }

    /// Whether both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &HostMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_storage() {
        let a = HostMemory::zeroed(4);
        let b = a.clone();
        assert!(b.fill_from(1, &[7, 8]));
        assert_eq!(a.to_vec(), vec![0, 7, 8, 0]);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_fill_out_of_range() {
        let mem = HostMemory::zeroed(4);
        assert!(!mem.fill_from(3, &[1, 2]));
        assert!(!mem.fill_from(usize::MAX, &[1]));
        assert_eq!(mem.to_vec(), vec![0; 4]);
    }

    #[test]
    fn test_typed_view() {
        let mem = HostMemory::from_slice(&[1u32, 2, 3]);
        assert_eq!(mem.len(), 12);
        assert_eq!(mem.to_typed::<u32>(), vec![1, 2, 3]);
    }
}
