//! The native driver seam.
//!
//! Everything the runtime asks of a vendor stack goes through [`Driver`]:
//! platform and device queries, contexts and queues, program builds, memory
//! objects, transfers, graphics interop and kernel submission. Handles are
//! opaque integers owned by the driver.
//!
//! The crate ships [`host::HostDriver`], a complete in-process
//! implementation that runs queues on worker threads and kernels as host
//! functions. It doubles as the fallback platform and as the driver tests
//! describe vendor hardware with.

pub mod host;
pub mod status;

pub use status::{status_name, NativeError, NativeResult, Status};

use crate::dispatch::ExecutionGrid;
use crate::memory::HostMemory;
use std::fmt;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);
    };
}

native_handle!(
    /// A native device.
    DeviceHandle
);
native_handle!(
    /// A native context.
    ContextHandle
);
native_handle!(
    /// A native command queue.
    QueueHandle
);
native_handle!(
    /// A built program for one device.
    ProgramHandle
);
native_handle!(
    /// A kernel entry point inside a built program.
    NativeKernel
);
native_handle!(
    /// A native memory object (buffer or image).
    MemHandle
);
native_handle!(
    /// A graphics share-group supplied by the windowing layer.
    ShareGroup
);
native_handle!(
    /// A graphics object (buffer, texture or render target).
    GraphicsObject
);

/// Identity strings of one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

/// Kind of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "CPU"),
            DeviceType::Gpu => write!(f, "GPU"),
            DeviceType::Accelerator => write!(f, "ACCELERATOR"),
        }
    }
}

/// Everything the catalog reads from a native device.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeDeviceInfo {
    pub handle: DeviceHandle,
    pub device_type: DeviceType,
    pub name: String,
    pub vendor: String,
    /// Driver version string; some implementations identify themselves here.
    pub version: String,
    pub language_version: String,
    pub extensions: Vec<String>,
    pub compute_units: u32,
    pub clock_mhz: u32,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub constant_mem_size: u64,
    pub max_alloc_size: u64,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: [usize; 3],
    pub image_support: bool,
    pub image2d_max: [usize; 2],
    pub image3d_max: [usize; 3],
    pub double_support: bool,
}

impl NativeDeviceInfo {
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext == name)
    }
}

/// Direction a memory object may be accessed in from kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl MemAccess {
    pub fn readable(self) -> bool {
        !matches!(self, MemAccess::WriteOnly)
    }

    pub fn writable(self) -> bool {
        !matches!(self, MemAccess::ReadOnly)
    }
}

/// How the native allocation is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocMode {
    /// Plain device allocation.
    Device,
    /// Device allocation initialized from host data at creation.
    CopyHostPtr,
    /// The host data itself is the storage.
    UseHostPtr,
    /// Driver-allocated, host-accessible (pinned) storage.
    AllocHostPtr,
}

/// Channel order of a native image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R,
    A,
    Rg,
    Rgb,
    Rgba,
    Bgra,
    Intensity,
    Luminance,
}

impl ChannelOrder {
    pub fn channels(self) -> usize {
        match self {
            ChannelOrder::R
            | ChannelOrder::A
            | ChannelOrder::Intensity
            | ChannelOrder::Luminance => 1,
            ChannelOrder::Rg => 2,
            ChannelOrder::Rgb => 3,
            ChannelOrder::Rgba | ChannelOrder::Bgra => 4,
        }
    }
}

/// Channel data type of a native image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    SnormInt8,
    SnormInt16,
    UnormInt8,
    UnormInt16,
    SignedInt8,
    SignedInt16,
    SignedInt32,
    UnsignedInt8,
    UnsignedInt16,
    UnsignedInt32,
    HalfFloat,
    Float,
}

impl ChannelType {
    pub fn size(self) -> usize {
        match self {
            ChannelType::SnormInt8
            | ChannelType::UnormInt8
            | ChannelType::SignedInt8
            | ChannelType::UnsignedInt8 => 1,
            ChannelType::SnormInt16
            | ChannelType::UnormInt16
            | ChannelType::SignedInt16
            | ChannelType::UnsignedInt16
            | ChannelType::HalfFloat => 2,
            ChannelType::SignedInt32 | ChannelType::UnsignedInt32 | ChannelType::Float => 4,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ChannelType::HalfFloat | ChannelType::Float)
    }
}

/// A native pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageFormat {
    pub const fn new(order: ChannelOrder, data_type: ChannelType) -> Self {
        Self { order, data_type }
    }

    /// Bytes per pixel.
    pub fn pixel_size(&self) -> usize {
        self.order.channels() * self.data_type.size()
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.order, self.data_type)
    }
}

/// Dimensionality of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Image1D,
    Image2D,
    Image3D,
}

impl ImageType {
    pub fn dims(self) -> usize {
        match self {
            ImageType::Image1D => 1,
            ImageType::Image2D => 2,
            ImageType::Image3D => 3,
        }
    }
}

/// Shape and format of an image allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub image_type: ImageType,
    pub extent: [usize; 3],
    pub format: ImageFormat,
}

impl ImageDesc {
    pub fn byte_size(&self) -> usize {
        self.extent.iter().product::<usize>() * self.format.pixel_size()
    }
}

/// A kernel argument value as handed to the driver.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    Mem(MemHandle),
    Bytes(&'a [u8]),
}

impl KernelArg<'_> {
    /// Size of the argument as the native call sees it.
    pub fn size(&self) -> usize {
        match self {
            KernelArg::Mem(_) => std::mem::size_of::<MemHandle>(),
            KernelArg::Bytes(bytes) => bytes.len(),
        }
    }
}

/// A failed program build.
#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub error: NativeError,
    pub log: String,
}

/// A host view of a mapped memory region.
///
/// Mapped regions must be handed back through [`Driver::enqueue_unmap`];
/// writes made to `data` become visible to the device only then.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    pub mem: MemHandle,
    pub offset: usize,
    pub size: usize,
    pub writable: bool,
    pub data: HostMemory,
}

/// The native interface the runtime is written against.
///
/// Every `enqueue_*` call is ordered on its queue. Calls with
/// `blocking == true` return after the command completed; the others return
/// once it is queued, and a later failure is reported by
/// [`finish`](Driver::finish).
pub trait Driver: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn platforms(&self) -> NativeResult<Vec<PlatformInfo>>;
    fn devices(&self, platform: usize) -> NativeResult<Vec<NativeDeviceInfo>>;

    fn create_context(
        &self,
        platform: usize,
        devices: &[DeviceHandle],
        share_group: Option<ShareGroup>,
    ) -> NativeResult<ContextHandle>;
    fn release_context(&self, context: ContextHandle);
    fn create_queue(&self, context: ContextHandle, device: DeviceHandle)
        -> NativeResult<QueueHandle>;
    fn release_queue(&self, queue: QueueHandle);
    fn supported_image_formats(&self, context: ContextHandle) -> NativeResult<Vec<ImageFormat>>;

    fn build_program(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        source: &str,
        options: &str,
    ) -> Result<ProgramHandle, BuildFailure>;
    fn program_binary(&self, program: ProgramHandle) -> NativeResult<Vec<u8>>;
    fn release_program(&self, program: ProgramHandle);
    fn create_kernel(&self, program: ProgramHandle, entry_point: &str)
        -> NativeResult<NativeKernel>;
    fn kernel_arg_count(&self, kernel: NativeKernel) -> NativeResult<u32>;
    fn kernel_work_group_size(&self, kernel: NativeKernel, device: DeviceHandle)
        -> NativeResult<usize>;
    fn set_kernel_arg(&self, kernel: NativeKernel, index: u32, arg: KernelArg<'_>)
        -> NativeResult<()>;
    fn release_kernel(&self, kernel: NativeKernel);

    fn create_buffer(
        &self,
        context: ContextHandle,
        access: MemAccess,
        mode: AllocMode,
        size: usize,
        host: Option<&HostMemory>,
    ) -> NativeResult<MemHandle>;
    fn create_sub_buffer(
        &self,
        parent: MemHandle,
        access: MemAccess,
        offset: usize,
        size: usize,
    ) -> NativeResult<MemHandle>;
    fn create_image(
        &self,
        context: ContextHandle,
        access: MemAccess,
        mode: AllocMode,
        desc: &ImageDesc,
        host: Option<&HostMemory>,
    ) -> NativeResult<MemHandle>;
    /// Wrap a graphics buffer; returns the handle and its byte size.
    fn create_graphics_buffer(
        &self,
        context: ContextHandle,
        access: MemAccess,
        object: GraphicsObject,
    ) -> NativeResult<(MemHandle, usize)>;
    /// Wrap a graphics texture or render target; the shape comes from the
    /// graphics object itself.
    fn create_graphics_image(
        &self,
        context: ContextHandle,
        access: MemAccess,
        object: GraphicsObject,
    ) -> NativeResult<(MemHandle, ImageDesc)>;
    fn release_mem(&self, mem: MemHandle);

    #[allow(clippy::too_many_arguments)]
    fn enqueue_write(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        src: &HostMemory,
        src_offset: usize,
        size: usize,
    ) -> NativeResult<()>;
    #[allow(clippy::too_many_arguments)]
    fn enqueue_read(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        dst: &HostMemory,
        dst_offset: usize,
    ) -> NativeResult<()>;
    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> NativeResult<()>;
    fn enqueue_write_image(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        src: &HostMemory,
    ) -> NativeResult<()>;
    fn enqueue_read_image(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        dst: &HostMemory,
    ) -> NativeResult<()>;
    fn enqueue_copy_image(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
    ) -> NativeResult<()>;
    fn enqueue_map(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        writable: bool,
    ) -> NativeResult<MappedRegion>;
    fn enqueue_unmap(&self, queue: QueueHandle, region: MappedRegion) -> NativeResult<()>;
    fn enqueue_acquire_graphics(&self, queue: QueueHandle, objects: &[MemHandle])
        -> NativeResult<()>;
    fn enqueue_release_graphics(&self, queue: QueueHandle, objects: &[MemHandle])
        -> NativeResult<()>;
    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: NativeKernel,
        grid: &ExecutionGrid,
    ) -> NativeResult<()>;

    fn flush(&self, queue: QueueHandle) -> NativeResult<()>;
    fn finish(&self, queue: QueueHandle) -> NativeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_sizes() {
        let rgba_f32 = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Float);
        assert_eq!(rgba_f32.pixel_size(), 16);
        let r_u8 = ImageFormat::new(ChannelOrder::R, ChannelType::UnormInt8);
        assert_eq!(r_u8.pixel_size(), 1);
        let desc = ImageDesc {
            image_type: ImageType::Image2D,
            extent: [4, 2, 1],
            format: rgba_f32,
        };
        assert_eq!(desc.byte_size(), 128);
    }

    #[test]
    fn test_access_direction() {
        assert!(MemAccess::ReadOnly.readable());
        assert!(!MemAccess::ReadOnly.writable());
        assert!(MemAccess::ReadWrite.writable());
        assert_eq!(KernelArg::Bytes(&[0u8; 12]).size(), 12);
    }
}
