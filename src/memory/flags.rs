//! Requested and validated memory-object flags.

use crate::driver::{AllocMode, MemAccess};
use tracing::warn;

/// Flags a caller asks for when creating a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemFlags {
    pub read: bool,
    pub write: bool,
    /// Use the caller's host memory as the storage itself.
    pub use_host_memory: bool,
    /// Write the host data to the device before every dispatch.
    pub copy_on_use: bool,
    /// Copy the host data into the allocation at creation.
    pub initial_copy: bool,
    pub block_read: bool,
    pub block_write: bool,
    /// Read the device contents back into the host data after every dispatch.
    pub read_back: bool,
    /// Delete the object once a dispatch using it completes.
    pub delete_after_use: bool,
    pub graphics_shared: bool,
    /// Acquire and release are left to the caller.
    pub manual_graphics_sharing: bool,
}

impl Default for MemFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            use_host_memory: false,
            copy_on_use: false,
            initial_copy: true,
            block_read: true,
            block_write: true,
            read_back: false,
            delete_after_use: false,
            graphics_shared: false,
            manual_graphics_sharing: false,
        }
    }
}

impl MemFlags {
    pub fn read_write() -> Self {
        Self::default()
    }

    pub fn read_only() -> Self {
        Self {
            write: false,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            ..Self::default()
        }
    }

    pub fn with_host_memory(mut self) -> Self {
        self.use_host_memory = true;
        self
    }

    pub fn with_copy_on_use(mut self) -> Self {
        self.copy_on_use = true;
        self
    }

    pub fn without_initial_copy(mut self) -> Self {
        self.initial_copy = false;
        self
    }

    pub fn with_read_back(mut self) -> Self {
        self.read_back = true;
        self
    }

    pub fn with_delete_after_use(mut self) -> Self {
        self.delete_after_use = true;
        self
    }

    /// Transfers return as soon as they are queued.
    pub fn non_blocking(mut self) -> Self {
        self.block_read = false;
        self.block_write = false;
        self
    }

    pub fn with_graphics_shared(mut self) -> Self {
        self.graphics_shared = true;
        self
    }

    pub fn with_manual_graphics_sharing(mut self) -> Self {
        self.graphics_shared = true;
        self.manual_graphics_sharing = true;
        self
    }
}

/// Flags after derivation; only [`ValidatedFlags::derive`] builds one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValidatedFlags(MemFlags);

impl ValidatedFlags {
    /// Derive the flag set an object actually carries.
    ///
    /// Neither direction means both. Initial copy needs host data and is
    /// dropped for host-backed objects. Copy-on-use and read-back need host
    /// data. Manual sharing needs graphics sharing.
    pub fn derive(requested: MemFlags, has_data: bool) -> Self {
        let mut flags = requested;
        if !flags.read && !flags.write {
            flags.read = true;
            flags.write = true;
        }
        flags.initial_copy = flags.initial_copy && has_data && !flags.use_host_memory;
        if !has_data && (flags.copy_on_use || flags.read_back) {
            warn!("copy-on-use and read-back dropped: no host data supplied");
            flags.copy_on_use = false;
            flags.read_back = false;
        }
        flags.manual_graphics_sharing = flags.manual_graphics_sharing && flags.graphics_shared;
        Self(flags)
    }

    pub fn get(&self) -> &MemFlags {
        &self.0
    }

    pub fn access(&self) -> MemAccess {
        match (self.0.read, self.0.write) {
            (true, false) => MemAccess::ReadOnly,
            (false, true) => MemAccess::WriteOnly,
            _ => MemAccess::ReadWrite,
        }
    }

    /// How the native allocation is backed.
    pub fn alloc_mode(&self, has_data: bool) -> AllocMode {
        match (self.0.use_host_memory, has_data) {
            (true, true) => AllocMode::UseHostPtr,
            (true, false) => AllocMode::AllocHostPtr,
            _ if self.0.initial_copy => AllocMode::CopyHostPtr,
            _ => AllocMode::Device,
        }
    }

    pub(crate) fn set_manual_graphics_sharing(&mut self, enabled: bool) {
        self.0.manual_graphics_sharing = enabled && self.0.graphics_shared;
    }
}

impl std::ops::Deref for ValidatedFlags {
    type Target = MemFlags;

    fn deref(&self) -> &MemFlags {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_flags() -> impl Strategy<Value = MemFlags> {
        proptest::collection::vec(any::<bool>(), 11).prop_map(|b| MemFlags {
            read: b[0],
            write: b[1],
            use_host_memory: b[2],
            copy_on_use: b[3],
            initial_copy: b[4],
            block_read: b[5],
            block_write: b[6],
            read_back: b[7],
            delete_after_use: b[8],
            graphics_shared: b[9],
            manual_graphics_sharing: b[10],
        })
    }

    proptest! {
        #[test]
        fn derived_flags_are_consistent(requested in any_flags(), has_data in any::<bool>()) {
            let flags = ValidatedFlags::derive(requested, has_data);
            prop_assert!(!(flags.initial_copy && flags.use_host_memory));
            prop_assert!(has_data || !(flags.copy_on_use || flags.read_back || flags.initial_copy));
            prop_assert!(!flags.manual_graphics_sharing || flags.graphics_shared);
            prop_assert!(flags.read || flags.write);
            prop_assert_eq!(ValidatedFlags::derive(requested, has_data), flags);
        }
    }

    #[test]
    fn test_alloc_mode() {
        let data = MemFlags::default();
        assert_eq!(ValidatedFlags::derive(data, true).alloc_mode(true), AllocMode::CopyHostPtr);
        assert_eq!(ValidatedFlags::derive(data, false).alloc_mode(false), AllocMode::Device);

        let host = MemFlags::default().with_host_memory();
        assert_eq!(ValidatedFlags::derive(host, true).alloc_mode(true), AllocMode::UseHostPtr);
        assert_eq!(ValidatedFlags::derive(host, false).alloc_mode(false), AllocMode::AllocHostPtr);
    }

    #[test]
    fn test_access() {
        let none = MemFlags {
            read: false,
            write: false,
            ..MemFlags::default()
        };
        assert_eq!(ValidatedFlags::derive(none, false).access(), MemAccess::ReadWrite);
        assert_eq!(
            ValidatedFlags::derive(MemFlags::read_only(), false).access(),
            MemAccess::ReadOnly
        );
    }
}
