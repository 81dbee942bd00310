use super::flags::{MemFlags, ValidatedFlags};
use super::host::HostMemory;
use crate::driver::{GraphicsObject, ImageFormat, ImageType, MemHandle};
use crate::kernel::KernelId;
use crate::util::slab::Key;
use std::collections::BTreeMap;
use std::fmt;

/// Handle to a memory object in the runtime's buffer registry.
///
/// Handles carry a generation: once the object is deleted, every copy of
/// the handle fails lookups instead of reaching a reused slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) Key);

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({:?})", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {:?}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    Buffer,
    SubBuffer,
    Image(ImageType),
}

impl MemKind {
    pub fn is_image(self) -> bool {
        matches!(self, MemKind::Image(_))
    }

    pub fn is_buffer(self) -> bool {
        !self.is_image()
    }
}

#[derive(Debug)]
pub(crate) struct MemObject {
    pub(crate) kind: MemKind,
    pub(crate) handle: MemHandle,
    pub(crate) size: usize,
    pub(crate) extent: [usize; 3],
    pub(crate) format: Option<ImageFormat>,
    pub(crate) flags: ValidatedFlags,
    pub(crate) parent: Option<BufferId>,
    pub(crate) children: Vec<BufferId>,
    pub(crate) host: Option<HostMemory>,
    pub(crate) graphics: Option<GraphicsObject>,
    /// Kernels this object is bound to, with the argument indices.
    pub(crate) kernels: BTreeMap<KernelId, Vec<u32>>,
}

impl MemObject {
    pub(crate) fn new(kind: MemKind, handle: MemHandle, size: usize, flags: ValidatedFlags) -> Self {
        Self {
            kind,
            handle,
            size,
            extent: [size, 1, 1],
            format: None,
            flags,
            parent: None,
            children: Vec::new(),
            host: None,
            graphics: None,
            kernels: BTreeMap::new(),
        }
    }

    pub(crate) fn associate(&mut self, kernel: KernelId, index: u32) {
        let indices = self.kernels.entry(kernel).or_default();
        if !indices.contains(&index) {
            indices.push(index);
        }
    }

    pub(crate) fn dissociate(&mut self, kernel: KernelId, index: u32) {
        if let Some(indices) = self.kernels.get_mut(&kernel) {
            indices.retain(|&i| i != index);
            if indices.is_empty() {
                self.kernels.remove(&kernel);
            }
        }
    }

    pub(crate) fn info(&self) -> BufferInfo {
        BufferInfo {
            kind: self.kind,
            size: self.size,
            extent: self.extent,
            format: self.format,
            flags: *self.flags.get(),
            parent: self.parent,
            sub_buffers: self.children.len(),
            has_host_data: self.host.is_some(),
            graphics: self.graphics,
            bound_kernels: self.kernels.len(),
        }
    }
}

/// A snapshot of one memory object.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    pub kind: MemKind,
    pub size: usize,
    pub extent: [usize; 3],
    pub format: Option<ImageFormat>,
    pub flags: MemFlags,
    pub parent: Option<BufferId>,
    pub sub_buffers: usize,
    pub has_host_data: bool,
    pub graphics: Option<GraphicsObject>,
    pub bound_kernels: usize,
}
