//! Explicit transfers between host memory and memory objects.
//!
//! Writes block iff the object carries the block-write flag and reads iff it
//! carries block-read. Every range is checked before the driver is called.

use super::host::HostMemory;
use super::model::get;
use super::object::{BufferId, MemKind};
use super::region::{validate_range, validate_region};
use crate::driver::{ImageType, MappedRegion, MemHandle, QueueHandle};
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use tracing::{error, trace};

/// A mapped buffer region; hand it back through [`Runtime::unmap`].
#[derive(Debug)]
pub struct MappedBuffer {
    id: BufferId,
    region: MappedRegion,
}

impl MappedBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn offset(&self) -> usize {
        self.region.offset
    }

    pub fn len(&self) -> usize {
        self.region.size
    }

    pub fn is_empty(&self) -> bool {
        self.region.size == 0
    }

    pub fn is_writable(&self) -> bool {
        self.region.writable
    }

    /// Host view of the region. Writes reach the device on unmap.
    pub fn data(&self) -> &HostMemory {
        &self.region.data
    }
}

struct Target {
    handle: MemHandle,
    kind: MemKind,
    size: usize,
    extent: [usize; 3],
    pixel: usize,
    block_read: bool,
    block_write: bool,
}

impl Target {
    fn image_type(&self, id: BufferId) -> Result<ImageType> {
        match self.kind {
            MemKind::Image(image_type) => Ok(image_type),
            _ => Err(Error::invalid_argument(format!("{id} is not an image"))),
        }
    }

    fn buffer(&self, id: BufferId) -> Result<()> {
        if self.kind.is_image() {
            return Err(Error::invalid_argument(format!("{id} is an image")));
        }
        Ok(())
    }
}

impl Runtime {
    fn target(&self, id: BufferId) -> Result<Target> {
        let objects = self.memory.lock();
        let object = get(&objects, id)?;
        Ok(Target {
            handle: object.handle,
            kind: object.kind,
            size: object.size,
            extent: object.extent,
            pixel: object.format.map_or(1, |f| f.pixel_size()),
            block_read: object.flags.block_read,
            block_write: object.flags.block_write,
        })
    }

    fn transfer_queue(&self) -> Result<QueueHandle> {
        self.ctx()?.active_queue()
    }

    /// Write `src` into the buffer at `offset`.
    pub fn write_buffer(&self, id: BufferId, offset: usize, src: &HostMemory) -> Result<()> {
        let ctx = self.ctx()?;
        let target = self.target(id)?;
        target.buffer(id)?;
        let size = src.len();
        validate_range("write_buffer", offset, size, target.size)?;
        let queue = self.transfer_queue()?;
        ctx.driver()
            .enqueue_write(queue, target.handle, target.block_write, offset, src, 0, size)
            .map_err(|source| {
                error!("write of {size} bytes at {offset} into {id} failed: {source}");
                Error::native("enqueue_write", source)
            })?;
        self.metrics.record_transfer(size);
        trace!("wrote {size} bytes into {id} at {offset}");
        Ok(())
    }

    /// Copy plain-old-data values into the buffer at byte `offset`.
    pub fn write_buffer_slice<T: bytemuck::Pod>(
        &self,
        id: BufferId,
        offset: usize,
        data: &[T],
    ) -> Result<()> {
        self.write_buffer(id, offset, &HostMemory::from_slice(data))
    }

    /// Read `size` bytes at `offset` into the start of `dst`.
    pub fn read_buffer(
        &self,
        id: BufferId,
        offset: usize,
        size: usize,
        dst: &HostMemory,
    ) -> Result<()> {
        let target = self.target(id)?;
        self.read_into(id, &target, offset, size, dst, target.block_read)
    }

    /// Read the whole buffer, always blocking.
    pub fn read_buffer_vec<T: bytemuck::Pod>(&self, id: BufferId) -> Result<Vec<T>> {
        let target = self.target(id)?;
        let dst = HostMemory::zeroed(target.size);
        self.read_into(id, &target, 0, target.size, &dst, true)?;
        Ok(dst.to_typed())
    }

    fn read_into(
        &self,
        id: BufferId,
        target: &Target,
        offset: usize,
        size: usize,
        dst: &HostMemory,
        blocking: bool,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        target.buffer(id)?;
        validate_range("read_buffer", offset, size, target.size)?;
        if dst.len() < size {
            return Err(Error::out_of_bounds("read_buffer destination", "size", size, dst.len()));
        }
        let queue = self.transfer_queue()?;
        ctx.driver()
            .enqueue_read(queue, target.handle, blocking, offset, size, dst, 0)
            .map_err(|source| {
                error!("read of {size} bytes at {offset} from {id} failed: {source}");
                Error::native("enqueue_read", source)
            })?;
        self.metrics.record_transfer(size);
        Ok(())
    }

    pub fn copy_buffer(
        &self,
        src: BufferId,
        dst: BufferId,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let from = self.target(src)?;
        let to = self.target(dst)?;
        from.buffer(src)?;
        to.buffer(dst)?;
        validate_range("copy_buffer source", src_offset, size, from.size)?;
        validate_range("copy_buffer destination", dst_offset, size, to.size)?;
        let queue = self.transfer_queue()?;
        ctx.driver()
            .enqueue_copy(queue, from.handle, to.handle, src_offset, dst_offset, size)
            .map_err(|source| {
                error!("copy of {size} bytes from {src} to {dst} failed: {source}");
                Error::native("enqueue_copy", source)
            })?;
        self.metrics.record_transfer(size);
        Ok(())
    }

    /// Write tightly packed pixels into an image region. A zero region
    /// component covers the whole axis.
    pub fn write_image(
        &self,
        id: BufferId,
        origin: [usize; 3],
        region: [usize; 3],
        src: &HostMemory,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let target = self.target(id)?;
        let (origin, region) =
            validate_region("write_image", target.image_type(id)?, target.extent, origin, region)?;
        let bytes = region.iter().product::<usize>() * target.pixel;
        if src.len() < bytes {
            return Err(Error::out_of_bounds("write_image source", "size", bytes, src.len()));
        }
        let queue = self.transfer_queue()?;
        ctx.driver()
            .enqueue_write_image(queue, target.handle, target.block_write, origin, region, src)
            .map_err(|source| {
                error!("image write {origin:?}+{region:?} into {id} failed: {source}");
                Error::native("enqueue_write_image", source)
            })?;
        self.metrics.record_transfer(bytes);
        Ok(())
    }

    /// Read an image region into `dst`, tightly packed.
    pub fn read_image(
        &self,
        id: BufferId,
        origin: [usize; 3],
        region: [usize; 3],
        dst: &HostMemory,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let target = self.target(id)?;
        let (origin, region) =
            validate_region("read_image", target.image_type(id)?, target.extent, origin, region)?;
        let bytes = region.iter().product::<usize>() * target.pixel;
        if dst.len() < bytes {
            return Err(Error::out_of_bounds("read_image destination", "size", bytes, dst.len()));
        }
        let queue = self.transfer_queue()?;
        ctx.driver()
            .enqueue_read_image(queue, target.handle, target.block_read, origin, region, dst)
            .map_err(|source| {
                error!("image read {origin:?}+{region:?} from {id} failed: {source}");
                Error::native("enqueue_read_image", source)
            })?;
        self.metrics.record_transfer(bytes);
        Ok(())
    }

    pub fn copy_image(
        &self,
        src: BufferId,
        dst: BufferId,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let from = self.target(src)?;
        let to = self.target(dst)?;
        if from.pixel != to.pixel {
            return Err(Error::invalid_argument(format!(
                "{src} and {dst} have different pixel sizes"
            )));
        }
        let (src_origin, region) =
            validate_region("copy_image source", from.image_type(src)?, from.extent, src_origin, region)?;
        let (dst_origin, _) =
            validate_region("copy_image destination", to.image_type(dst)?, to.extent, dst_origin, region)?;
        let queue = self.transfer_queue()?;
        ctx.driver()
            .enqueue_copy_image(queue, from.handle, to.handle, src_origin, dst_origin, region)
            .map_err(|source| {
                error!("image copy from {src} to {dst} failed: {source}");
                Error::native("enqueue_copy_image", source)
            })?;
        self.metrics
            .record_transfer(region.iter().product::<usize>() * from.pixel);
        Ok(())
    }

    /// Map `size` bytes at `offset` for host access. Whether the call waits
    /// for the map is chosen here, independent of the buffer's flags.
    pub fn map_buffer(
        &self,
        id: BufferId,
        offset: usize,
        size: usize,
        writable: bool,
        blocking: bool,
    ) -> Result<MappedBuffer> {
        let ctx = self.ctx()?;
        let target = self.target(id)?;
        target.buffer(id)?;
        validate_range("map_buffer", offset, size, target.size)?;
        let queue = self.transfer_queue()?;
        let region = ctx
            .driver()
            .enqueue_map(queue, target.handle, blocking, offset, size, writable)
            .map_err(|source| {
                error!("map of {offset}+{size} in {id} failed: {source}");
                Error::native("enqueue_map", source)
            })?;
        Ok(MappedBuffer { id, region })
    }

    pub fn unmap(&self, mapped: MappedBuffer) -> Result<()> {
        let ctx = self.ctx()?;
        let queue = self.transfer_queue()?;
        let id = mapped.id;
        ctx.driver()
            .enqueue_unmap(queue, mapped.region)
            .map_err(|source| {
                error!("unmap of {id} failed: {source}");
                Error::native("enqueue_unmap", source)
            })
    }

    /// Acquire manually managed graphics objects for compute use.
    pub fn acquire_graphics(&self, ids: &[BufferId]) -> Result<()> {
        let handles = self.manual_graphics(ids)?;
        let ctx = self.ctx()?;
        ctx.driver()
            .enqueue_acquire_graphics(self.transfer_queue()?, &handles)
            .map_err(|source| {
                error!("acquiring {} graphics object(s) failed: {source}", handles.len());
                Error::native("enqueue_acquire_graphics", source)
            })
    }

    /// Hand manually managed graphics objects back to the graphics layer.
    pub fn release_graphics(&self, ids: &[BufferId]) -> Result<()> {
        let handles = self.manual_graphics(ids)?;
        let ctx = self.ctx()?;
        ctx.driver()
            .enqueue_release_graphics(self.transfer_queue()?, &handles)
            .map_err(|source| {
                error!("releasing {} graphics object(s) failed: {source}", handles.len());
                Error::native("enqueue_release_graphics", source)
            })
    }

    fn manual_graphics(&self, ids: &[BufferId]) -> Result<Vec<MemHandle>> {
        self.ctx()?;
        let objects = self.memory.lock();
        ids.iter()
            .map(|&id| {
                let object = get(&objects, id)?;
                if !object.flags.manual_graphics_sharing {
                    return Err(Error::invalid_argument(format!(
                        "{id} is not a manually shared graphics object"
                    )));
                }
                Ok(object.handle)
            })
            .collect()
    }
}
