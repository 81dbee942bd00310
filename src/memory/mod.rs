//! The memory object model: buffers, sub-buffers, images and
//! graphics-shared objects, their flags, kernel associations and lifetime.

pub mod flags;
pub mod host;
pub(crate) mod model;
pub mod object;
pub mod region;
mod transfer;

pub use flags::{MemFlags, ValidatedFlags};
pub use host::HostMemory;
pub use object::{BufferId, BufferInfo, MemKind};
pub use region::{validate_range, validate_region};
pub use transfer::MappedBuffer;

use crate::context::{ChannelLayout, ComputeContext, ElementType};
use crate::driver::{AllocMode, GraphicsObject, ImageDesc, ImageType};
use crate::error::{Error, Result};
use crate::kernel::registry::RegistryState;
use crate::runtime::Runtime;
use model::get;
use object::MemObject;
use std::cell::RefCell;
use tracing::{debug, error, warn};

impl Runtime {
    /// Create a linear buffer of `size` bytes.
    ///
    /// `data` is the external host memory: the initial contents, the storage
    /// itself for host-backed buffers, and the source and sink of copy-on-use
    /// and read-back transfers.
    pub fn create_buffer(
        &self,
        flags: MemFlags,
        size: usize,
        data: Option<HostMemory>,
    ) -> Result<BufferId> {
        let ctx = self.ctx()?;
        if size == 0 {
            warn!("create_buffer: zero-sized buffer requested");
            return Err(Error::invalid_argument("buffer size must be non-zero"));
        }
        let flags = ValidatedFlags::derive(flags, data.is_some());
        let mode = flags.alloc_mode(data.is_some());
        let host = host_for(mode, data.as_ref());
        if let Some(host) = host {
            if host.len() < size {
                return Err(Error::invalid_argument(format!(
                    "host data holds {} bytes, buffer needs {size}",
                    host.len()
                )));
            }
        }

        let handle = ctx
            .driver()
            .create_buffer(ctx.handle(), flags.access(), mode, size, host)
            .map_err(|source| {
                error!("create_buffer of {size} bytes ({mode:?}) failed: {source}");
                Error::native("create_buffer", source)
            })?;

        let mut object = MemObject::new(MemKind::Buffer, handle, size, flags);
        object.host = data;
        let id = self.memory.insert(object);
        debug!("{id}: {size} bytes, {mode:?}");
        Ok(id)
    }

    /// Create a view of `size` bytes at `offset` inside `parent`.
    pub fn create_sub_buffer(
        &self,
        parent: BufferId,
        flags: MemFlags,
        offset: usize,
        size: usize,
    ) -> Result<BufferId> {
        let ctx = self.ctx()?;
        let (parent_handle, parent_size, parent_kind) =
            self.memory.with(parent, |p| (p.handle, p.size, p.kind))?;
        if parent_kind != MemKind::Buffer {
            return Err(Error::invalid_argument(
                "sub-buffers can only be created from plain buffers",
            ));
        }
        if size == 0 {
            return Err(Error::invalid_argument("sub-buffer size must be non-zero"));
        }
        if size > parent_size {
            return Err(Error::out_of_bounds("sub-buffer", "size", size, parent_size));
        }
        if offset >= parent_size {
            return Err(Error::out_of_bounds("sub-buffer", "offset", offset, parent_size));
        }
        let end = offset.saturating_add(size);
        if end > parent_size {
            return Err(Error::out_of_bounds("sub-buffer", "offset + size", end, parent_size));
        }

        let flags = ValidatedFlags::derive(flags.without_initial_copy(), false);
        let handle = ctx
            .driver()
            .create_sub_buffer(parent_handle, flags.access(), offset, size)
            .map_err(|source| {
                error!("create_sub_buffer {offset}+{size} of {parent} failed: {source}");
                Error::native("create_sub_buffer", source)
            })?;

        let mut object = MemObject::new(MemKind::SubBuffer, handle, size, flags);
        object.parent = Some(parent);
        let mut objects = self.memory.lock();
        let id = BufferId(objects.insert(object));
        match model::get_mut(&mut objects, parent) {
            Ok(parent) => parent.children.push(id),
            Err(err) => {
                objects.remove(id.0);
                drop(objects);
                ctx.driver().release_mem(handle);
                return Err(err);
            }
        }
        Ok(id)
    }

    pub fn create_image_1d(
        &self,
        flags: MemFlags,
        layout: ChannelLayout,
        element: ElementType,
        width: usize,
        data: Option<HostMemory>,
    ) -> Result<BufferId> {
        self.create_image(flags, layout, element, ImageType::Image1D, [width, 1, 1], data)
    }

    pub fn create_image_2d(
        &self,
        flags: MemFlags,
        layout: ChannelLayout,
        element: ElementType,
        dims: [usize; 2],
        data: Option<HostMemory>,
    ) -> Result<BufferId> {
        self.create_image(
            flags,
            layout,
            element,
            ImageType::Image2D,
            [dims[0], dims[1], 1],
            data,
        )
    }

    pub fn create_image_3d(
        &self,
        flags: MemFlags,
        layout: ChannelLayout,
        element: ElementType,
        dims: [usize; 3],
        data: Option<HostMemory>,
    ) -> Result<BufferId> {
        self.create_image(flags, layout, element, ImageType::Image3D, dims, data)
    }

    fn create_image(
        &self,
        flags: MemFlags,
        layout: ChannelLayout,
        element: ElementType,
        image_type: ImageType,
        extent: [usize; 3],
        data: Option<HostMemory>,
    ) -> Result<BufferId> {
        let ctx = self.ctx()?;
        check_image_limits(ctx, image_type, extent)?;
        let format = ctx.image_format(element, layout)?;
        let desc = ImageDesc {
            image_type,
            extent,
            format,
        };

        let flags = ValidatedFlags::derive(flags, data.is_some());
        let mode = flags.alloc_mode(data.is_some());
        let host = host_for(mode, data.as_ref());
        if let Some(host) = host {
            if host.len() < desc.byte_size() {
                return Err(Error::invalid_argument(format!(
                    "host data holds {} bytes, image needs {} ({format})",
                    host.len(),
                    desc.byte_size()
                )));
            }
        }

        let handle = ctx
            .driver()
            .create_image(ctx.handle(), flags.access(), mode, &desc, host)
            .map_err(|source| {
                error!("create_image {extent:?} {format} failed: {source}");
                Error::native("create_image", source)
            })?;

        let mut object = MemObject::new(MemKind::Image(image_type), handle, desc.byte_size(), flags);
        object.extent = extent;
        object.format = Some(format);
        object.host = data;
        let id = self.memory.insert(object);
        debug!("{id}: {image_type:?} {extent:?} {format}");
        Ok(id)
    }

    /// Wrap a graphics buffer.
    pub fn create_graphics_buffer(
        &self,
        flags: MemFlags,
        object: GraphicsObject,
    ) -> Result<BufferId> {
        let ctx = self.ctx()?;
        require_sharing(ctx)?;
        let flags = ValidatedFlags::derive(flags.with_graphics_shared(), false);
        let (handle, size) = ctx
            .driver()
            .create_graphics_buffer(ctx.handle(), flags.access(), object)
            .map_err(|source| {
                error!("create_graphics_buffer for object {} failed: {source}", object.0);
                Error::native("create_graphics_buffer", source)
            })?;
        let mut mem = MemObject::new(MemKind::Buffer, handle, size, flags);
        mem.graphics = Some(object);
        Ok(self.memory.insert(mem))
    }

    /// Wrap a graphics texture; its width, height and format come from the
    /// texture.
    pub fn create_graphics_image_2d(
        &self,
        flags: MemFlags,
        texture: GraphicsObject,
    ) -> Result<BufferId> {
        self.create_graphics_image(flags, texture, "texture")
    }

    /// Wrap a graphics render target.
    pub fn create_graphics_image_2d_renderbuffer(
        &self,
        flags: MemFlags,
        renderbuffer: GraphicsObject,
    ) -> Result<BufferId> {
        self.create_graphics_image(flags, renderbuffer, "render target")
    }

    fn create_graphics_image(
        &self,
        flags: MemFlags,
        object: GraphicsObject,
        what: &str,
    ) -> Result<BufferId> {
        let ctx = self.ctx()?;
        require_sharing(ctx)?;
        let flags = ValidatedFlags::derive(flags.with_graphics_shared(), false);
        let (handle, desc) = ctx
            .driver()
            .create_graphics_image(ctx.handle(), flags.access(), object)
            .map_err(|source| {
                error!("wrapping {what} {} failed: {source}", object.0);
                Error::native("create_graphics_image", source)
            })?;
        let mut mem = MemObject::new(MemKind::Image(desc.image_type), handle, desc.byte_size(), flags);
        mem.extent = desc.extent;
        mem.format = Some(desc.format);
        mem.graphics = Some(object);
        let id = self.memory.insert(mem);
        debug!("{id}: {what} {}x{} {}", desc.extent[0], desc.extent[1], desc.format);
        Ok(id)
    }

    /// Delete a memory object. Sub-buffers go first, then the object is
    /// unbound from every kernel and its native handle released.
    pub fn delete_buffer(&self, id: BufferId) -> Result<()> {
        let ctx = self.ctx()?;
        let registry = self.registry.lock();
        self.delete_buffer_locked(ctx, &registry, id)
    }

    pub(crate) fn delete_buffer_locked(
        &self,
        ctx: &ComputeContext,
        registry: &RefCell<RegistryState>,
        id: BufferId,
    ) -> Result<()> {
        let (children, kernels) = {
            let objects = self.memory.lock();
            let object = get(&objects, id)?;
            (object.children.clone(), object.kernels.clone())
        };
        for child in children {
            self.delete_buffer_locked(ctx, registry, child)?;
        }

        {
            let mut state = registry.borrow_mut();
            for (kernel, indices) in &kernels {
                match state.kernels.get_mut(kernel.0) {
                    Some(kernel) => {
                        for &index in indices {
                            kernel.unbind(index);
                        }
                    }
                    None => warn!("{id} referenced deleted kernel {kernel:?}"),
                }
            }
        }

        let removed = {
            let mut objects = self.memory.lock();
            let removed = objects.remove(id.0).ok_or(Error::InvalidHandle("buffer"))?;
            if let Some(parent) = removed.parent {
                if let Ok(parent) = model::get_mut(&mut objects, parent) {
                    parent.children.retain(|&child| child != id);
                }
            }
            removed
        };
        ctx.driver().release_mem(removed.handle);
        debug!("{id} deleted");
        Ok(())
    }

    /// Take over acquire and release of a graphics-shared object.
    pub fn set_manual_graphics_sharing(&self, id: BufferId, enabled: bool) -> Result<()> {
        self.ctx()?;
        self.memory.with_mut(id, |object| {
            if !object.flags.graphics_shared {
                return Err(Error::invalid_argument(format!(
                    "{id} is not graphics-shared"
                )));
            }
            object.flags.set_manual_graphics_sharing(enabled);
            Ok(())
        })?
    }

    pub fn buffer_info(&self, id: BufferId) -> Result<BufferInfo> {
        self.memory.with(id, MemObject::info)
    }

    pub fn contains_buffer(&self, id: BufferId) -> bool {
        self.memory.with(id, |_| ()).is_ok()
    }

    pub fn buffer_count(&self) -> usize {
        self.memory.len()
    }
}

/// The host memory handed to the native allocation, if the mode takes any.
fn host_for(mode: AllocMode, data: Option<&HostMemory>) -> Option<&HostMemory> {
    match mode {
        AllocMode::UseHostPtr | AllocMode::CopyHostPtr => data,
        AllocMode::Device | AllocMode::AllocHostPtr => None,
    }
}

fn require_sharing(ctx: &ComputeContext) -> Result<()> {
    if ctx.share_group().is_none() {
        return Err(Error::invalid_argument(
            "the context was created without graphics sharing",
        ));
    }
    Ok(())
}

fn check_image_limits(ctx: &ComputeContext, image_type: ImageType, extent: [usize; 3]) -> Result<()> {
    let device = ctx
        .active_device()
        .ok_or_else(|| Error::invalid_argument("no active device"))?;
    if !device.image_support {
        return Err(Error::invalid_argument(format!("{device} has no image support")));
    }
    const AXES: [&str; 3] = ["width", "height", "depth"];
    let limits = match image_type {
        ImageType::Image1D | ImageType::Image2D => {
            [device.image2d_max[0], device.image2d_max[1], 1]
        }
        ImageType::Image3D => device.image3d_max,
    };
    for axis in 0..image_type.dims() {
        if extent[axis] == 0 {
            return Err(Error::invalid_argument(format!(
                "image {} must be non-zero",
                AXES[axis]
            )));
        }
        if extent[axis] > limits[axis] {
            return Err(Error::out_of_bounds("image", AXES[axis], extent[axis], limits[axis]));
        }
    }
    Ok(())
}
