//! In-process driver.
//!
//! `HostDriver` implements [`Driver`] without any vendor stack. Platforms and
//! devices are described by [`HostPlatformSpec`] and [`HostDeviceSpec`], so a
//! test can stand up "an AMD platform with a CPU and a GPU" or "a POCL CPU
//! reporting zero compute units" and drive the runtime against it. Each queue
//! runs on its own worker thread; kernels are Rust closures registered by
//! entry-point name.

mod graphics;
mod kernel;
mod program;
mod queue;

pub use graphics::GraphicsKind;
pub use kernel::{HostInvocation, HostKernelFn};

use self::graphics::GraphicsEntry;
use self::kernel::{builtin_kernels, HostArg, HostKernelTable, Storage};
use self::program::{live_error_directive, parse_defines, scan_kernels};
use self::queue::HostQueue;
use super::{
    AllocMode, BuildFailure, ChannelOrder, ChannelType, ContextHandle, DeviceHandle, DeviceType,
    Driver, GraphicsObject, ImageDesc, ImageFormat, ImageType, KernelArg, MappedRegion, MemAccess,
    MemHandle, NativeDeviceInfo, NativeError, NativeKernel, NativeResult, PlatformInfo,
    ProgramHandle, QueueHandle, ShareGroup, Status,
};
use crate::dispatch::ExecutionGrid;
use crate::memory::HostMemory;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Magic number of the bitcode wrapper Apple drivers put around binaries.
pub const BITCODE_WRAPPER_MAGIC: u32 = 0x0B17_C0DE;
/// Magic prefix of a raw LLVM bitcode stream.
pub const BITCODE_MAGIC: [u8; 4] = [b'B', b'C', 0xC0, 0xDE];

/// Description of one emulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDeviceSpec {
    pub device_type: DeviceType,
    pub name: String,
    pub vendor: String,
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

fn default_extensions() -> Vec<String> {
    vec![
        "cl_khr_byte_addressable_store".to_string(),
        "cl_khr_global_int32_base_atomics".to_string(),
    ]
}

impl HostDeviceSpec {
    /// A CPU sized after the machine running the process.
    pub fn cpu(name: &str) -> Self {
        Self {
            device_type: DeviceType::Cpu,
            name: name.to_string(),
            vendor: "veda-cl".to_string(),
            version: "OpenCL 1.2 host".to_string(),
            language_version: "OpenCL C 1.2".to_string(),
            extensions: default_extensions(),
            compute_units: num_cpus::get() as u32,
            clock_mhz: 1000,
            global_mem_size: 1 << 32,
            local_mem_size: 32 * 1024,
            constant_mem_size: 64 * 1024,
            max_alloc_size: 1 << 30,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 1024],
            image_support: true,
            image2d_max: [8192, 8192],
            image3d_max: [2048, 2048, 2048],
            double_support: true,
        }
    }

    pub fn gpu(name: &str, vendor: &str) -> Self {
        Self {
            device_type: DeviceType::Gpu,
            name: name.to_string(),
            vendor: vendor.to_string(),
            version: "OpenCL 1.2".to_string(),
            language_version: "OpenCL C 1.2".to_string(),
            extensions: default_extensions(),
            compute_units: 16,
            clock_mhz: 1000,
            global_mem_size: 4 << 30,
            local_mem_size: 48 * 1024,
            constant_mem_size: 64 * 1024,
            max_alloc_size: 1 << 30,
            max_work_group_size: 256,
            max_work_item_sizes: [256, 256, 64],
            image_support: true,
            image2d_max: [16384, 16384],
            image3d_max: [2048, 2048, 2048],
            double_support: false,
        }
    }

    pub fn accelerator(name: &str, vendor: &str) -> Self {
        Self {
            device_type: DeviceType::Accelerator,
            image_support: false,
            ..Self::gpu(name, vendor)
        }
    }

    pub fn with_compute(mut self, compute_units: u32, clock_mhz: u32) -> Self {
        self.compute_units = compute_units;
        self.clock_mhz = clock_mhz;
        self
    }

    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn with_max_work_item_sizes(mut self, sizes: [usize; 3]) -> Self {
        self.max_work_item_sizes = sizes;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|ext| ext.to_string()).collect();
        self
    }

    pub fn with_local_mem_size(mut self, size: u64) -> Self {
        self.local_mem_size = size;
        self
    }

    pub fn with_double_support(mut self, enabled: bool) -> Self {
        self.double_support = enabled;
        self
    }

    pub fn without_images(mut self) -> Self {
        self.image_support = false;
        self
    }

    fn to_info(&self, handle: DeviceHandle) -> NativeDeviceInfo {
        NativeDeviceInfo {
            handle,
            device_type: self.device_type,
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            version: self.version.clone(),
            language_version: self.language_version.clone(),
            extensions: self.extensions.clone(),
            compute_units: self.compute_units,
            clock_mhz: self.clock_mhz,
            global_mem_size: self.global_mem_size,
            local_mem_size: self.local_mem_size,
            constant_mem_size: self.constant_mem_size,
            max_alloc_size: self.max_alloc_size,
            max_work_group_size: self.max_work_group_size,
            max_work_item_sizes: self.max_work_item_sizes,
            image_support: self.image_support,
            image2d_max: self.image2d_max,
            image3d_max: self.image3d_max,
            double_support: self.double_support,
        }
    }
}

/// Description of one emulated platform.
#[derive(Debug, Clone, PartialEq)]
pub struct HostPlatformSpec {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<HostDeviceSpec>,
    pub image_formats: Vec<ImageFormat>,
    /// Every context creation on this platform fails.
    pub fail_context_creation: bool,
}

impl HostPlatformSpec {
    pub fn new(name: &str, vendor: &str) -> Self {
        Self {
            name: name.to_string(),
            vendor: vendor.to_string(),
            version: "OpenCL 1.2".to_string(),
            devices: Vec::new(),
            image_formats: default_image_formats(),
            fail_context_creation: false,
        }
    }

    pub fn with_device(mut self, device: HostDeviceSpec) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_image_formats(mut self, formats: Vec<ImageFormat>) -> Self {
        self.image_formats = formats;
        self
    }

    pub fn refusing_contexts(mut self) -> Self {
        self.fail_context_creation = true;
        self
    }

    fn is_apple(&self) -> bool {
        self.name.to_lowercase().contains("apple") || self.vendor.to_lowercase().contains("apple")
    }
}

/// The formats a typical driver reports: one, two and four channel layouts
/// over every common channel type, plus 8-bit BGRA. No three-channel format.
pub fn default_image_formats() -> Vec<ImageFormat> {
    const TYPES: [ChannelType; 10] = [
        ChannelType::UnormInt8,
        ChannelType::UnormInt16,
        ChannelType::SignedInt8,
        ChannelType::SignedInt16,
        ChannelType::SignedInt32,
        ChannelType::UnsignedInt8,
        ChannelType::UnsignedInt16,
        ChannelType::UnsignedInt32,
        ChannelType::HalfFloat,
        ChannelType::Float,
    ];
    let mut formats = Vec::new();
    for order in [ChannelOrder::R, ChannelOrder::Rg, ChannelOrder::Rgba] {
        for data_type in TYPES {
            formats.push(ImageFormat::new(order, data_type));
        }
    }
    formats.push(ImageFormat::new(ChannelOrder::Bgra, ChannelType::UnormInt8));
    formats
}

/// Counters describing what the driver has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub builds: u64,
    pub kernel_submissions: u64,
    pub transfers: u64,
    pub acquires: u64,
    pub releases: u64,
    pub live_mem_objects: usize,
    pub live_kernels: usize,
    pub live_programs: usize,
    pub live_queues: usize,
}

#[derive(Debug, Default)]
struct Counters {
    builds: AtomicU64,
    kernel_submissions: AtomicU64,
    transfers: AtomicU64,
    acquires: AtomicU64,
    releases: AtomicU64,
}

struct ContextEntry {
    platform: usize,
    devices: Vec<DeviceHandle>,
    share_group: Option<ShareGroup>,
}

struct QueueEntry {
    context: ContextHandle,
    device: DeviceHandle,
    queue: Arc<HostQueue>,
}

struct ProgramEntry {
    device: DeviceHandle,
    entries: HashMap<String, u32>,
    defines: Arc<HashMap<String, String>>,
    binary: Vec<u8>,
}

#[derive(Clone)]
enum BoundArg {
    Mem(MemHandle),
    Bytes(Vec<u8>),
}

struct KernelEntry {
    name: String,
    device: DeviceHandle,
    args: Vec<Option<BoundArg>>,
    defines: Arc<HashMap<String, String>>,
    body: Arc<HostKernelFn>,
}

struct MemEntry {
    context: ContextHandle,
    storage: Storage,
    image: Option<ImageDesc>,
    graphics: Option<GraphicsObject>,
    parent: Option<MemHandle>,
    acquired: bool,
    mapped: usize,
}

#[derive(Default)]
struct HostState {
    next_handle: u64,
    contexts: HashMap<ContextHandle, ContextEntry>,
    queues: HashMap<QueueHandle, QueueEntry>,
    programs: HashMap<ProgramHandle, ProgramEntry>,
    kernels: HashMap<NativeKernel, KernelEntry>,
    mems: HashMap<MemHandle, MemEntry>,
    share_groups: HashSet<ShareGroup>,
    graphics: HashMap<GraphicsObject, GraphicsEntry>,
}

fn fail<T>(status: Status, detail: impl Into<String>) -> NativeResult<T> {
    Err(NativeError::new(status, detail))
}

impl HostState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn context(&self, handle: ContextHandle) -> NativeResult<&ContextEntry> {
        self.contexts.get(&handle).ok_or_else(|| {
            NativeError::new(Status::INVALID_CONTEXT, format!("unknown context {}", handle.0))
        })
    }

    fn queue(&self, handle: QueueHandle) -> NativeResult<&QueueEntry> {
        self.queues.get(&handle).ok_or_else(|| {
            NativeError::new(
                Status::INVALID_COMMAND_QUEUE,
                format!("unknown queue {}", handle.0),
            )
        })
    }

    fn mem(&self, handle: MemHandle) -> NativeResult<&MemEntry> {
        self.mems.get(&handle).ok_or_else(|| {
            NativeError::new(
                Status::INVALID_MEM_OBJECT,
                format!("unknown memory object {}", handle.0),
            )
        })
    }

    fn mem_mut(&mut self, handle: MemHandle) -> NativeResult<&mut MemEntry> {
        self.mems.get_mut(&handle).ok_or_else(|| {
            NativeError::new(
                Status::INVALID_MEM_OBJECT,
                format!("unknown memory object {}", handle.0),
            )
        })
    }

    fn kernel_mut(&mut self, handle: NativeKernel) -> NativeResult<&mut KernelEntry> {
        self.kernels.get_mut(&handle).ok_or_else(|| {
            NativeError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", handle.0))
        })
    }

    /// Queue plus a memory object living in the queue's context.
    fn target(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
    ) -> NativeResult<(Arc<HostQueue>, Storage, Option<ImageDesc>)> {
        let queue = self.queue(queue)?;
        let entry = self.mem(mem)?;
        if entry.context != queue.context {
            return fail(
                Status::INVALID_CONTEXT,
                "memory object and queue belong to different contexts",
            );
        }
        Ok((queue.queue.clone(), entry.storage.clone(), entry.image))
    }
}

fn check_range(offset: usize, size: usize, len: usize, what: &str) -> NativeResult<()> {
    match offset.checked_add(size) {
        Some(end) if size > 0 && end <= len => Ok(()),
        _ => fail(
            Status::INVALID_VALUE,
            format!("{what}: range {offset}+{size} outside {len} bytes"),
        ),
    }
}

fn check_image_region(desc: &ImageDesc, origin: [usize; 3], region: [usize; 3]) -> NativeResult<()> {
    for axis in 0..3 {
        let end = origin[axis].checked_add(region[axis]);
        if region[axis] == 0 || end.map_or(true, |end| end > desc.extent[axis]) {
            return fail(
                Status::INVALID_VALUE,
                format!(
                    "image region {:?}+{:?} outside extent {:?} on axis {axis}",
                    origin, region, desc.extent
                ),
            );
        }
    }
    Ok(())
}

/// Byte offset of every row of `region` inside the image storage.
fn row_offsets(desc: &ImageDesc, origin: [usize; 3], region: [usize; 3]) -> Vec<usize> {
    let pixel = desc.format.pixel_size();
    let mut rows = Vec::with_capacity(region[1] * region[2]);
    for z in 0..region[2] {
        for y in 0..region[1] {
            let row = (origin[2] + z) * desc.extent[1] + origin[1] + y;
            rows.push((row * desc.extent[0] + origin[0]) * pixel);
        }
    }
    rows
}

fn backing(mode: AllocMode, size: usize, host: Option<&HostMemory>) -> NativeResult<Storage> {
    match (mode, host) {
        (AllocMode::UseHostPtr, Some(host)) => {
            if host.len() < size {
                return fail(Status::INVALID_HOST_PTR, "host memory smaller than the object");
            }
            Ok(Storage {
                data: host.clone(),
                offset: 0,
                len: size,
            })
        }
        (AllocMode::CopyHostPtr, Some(host)) => {
            let data = host.read();
            match data.get(..size) {
                Some(bytes) => Ok(Storage::whole(HostMemory::from_vec(bytes.to_vec()))),
                None => fail(Status::INVALID_HOST_PTR, "host memory smaller than the object"),
            }
        }
        (AllocMode::UseHostPtr | AllocMode::CopyHostPtr, None) => {
            fail(Status::INVALID_HOST_PTR, "allocation mode requires host memory")
        }
        (AllocMode::Device | AllocMode::AllocHostPtr, Some(_)) => {
            fail(Status::INVALID_HOST_PTR, "host memory given without a host allocation mode")
        }
        (AllocMode::Device | AllocMode::AllocHostPtr, None) => {
            Ok(Storage::whole(HostMemory::zeroed(size)))
        }
    }
}

fn wrap_bitcode(payload: &[u8]) -> Vec<u8> {
    const HEADER: u32 = 20;
    let mut out = Vec::with_capacity(HEADER as usize + payload.len());
    out.extend_from_slice(&BITCODE_WRAPPER_MAGIC.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&HEADER.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&7u32.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// An in-process implementation of [`Driver`].
pub struct HostDriver {
    name: String,
    platforms: Vec<HostPlatformSpec>,
    bodies: RwLock<HostKernelTable>,
    state: Mutex<HostState>,
    counters: Counters,
}

impl fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDriver")
            .field("name", &self.name)
            .field("platforms", &self.platforms.len())
            .field("kernels", &self.bodies.read().len())
            .finish_non_exhaustive()
    }
}

impl HostDriver {
    /// A driver exposing `platforms`, with the internal kernels registered.
    pub fn new(name: &str, platforms: Vec<HostPlatformSpec>) -> Self {
        Self {
            name: name.to_string(),
            platforms,
            bodies: RwLock::new(builtin_kernels()),
            state: Mutex::new(HostState::default()),
            counters: Counters::default(),
        }
    }

    /// One host platform with one CPU device describing this machine.
    pub fn system() -> Self {
        Self::new(
            "host",
            vec![HostPlatformSpec::new("Host Compute Platform", "veda-cl")
                .with_device(HostDeviceSpec::cpu("Host CPU"))],
        )
    }

    /// Register the body executed for kernels whose entry point is `entry`.
    pub fn register_kernel<F>(&self, entry: &str, body: F)
    where
        F: Fn(&mut HostInvocation<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.bodies.write().insert(entry.to_string(), Arc::new(body));
    }

    pub fn create_share_group(&self) -> ShareGroup {
        let mut state = self.state.lock();
        let group = ShareGroup(state.next());
        state.share_groups.insert(group);
        group
    }

    fn new_graphics(&self, group: ShareGroup, kind: GraphicsKind) -> NativeResult<GraphicsObject> {
        let mut state = self.state.lock();
        if !state.share_groups.contains(&group) {
            return fail(
                Status::INVALID_GL_SHAREGROUP_REFERENCE,
                format!("unknown share-group {}", group.0),
            );
        }
        let object = GraphicsObject(state.next());
        state.graphics.insert(object, GraphicsEntry::new(group, kind));
        Ok(object)
    }

    pub fn new_graphics_buffer(&self, group: ShareGroup, size: usize) -> NativeResult<GraphicsObject> {
        self.new_graphics(group, GraphicsKind::Buffer { size })
    }

    pub fn new_texture(
        &self,
        group: ShareGroup,
        width: usize,
        height: usize,
        format: ImageFormat,
    ) -> NativeResult<GraphicsObject> {
        self.new_graphics(
            group,
            GraphicsKind::Texture {
                width,
                height,
                format,
            },
        )
    }

    pub fn new_renderbuffer(
        &self,
        group: ShareGroup,
        width: usize,
        height: usize,
        format: ImageFormat,
    ) -> NativeResult<GraphicsObject> {
        self.new_graphics(
            group,
            GraphicsKind::Renderbuffer {
                width,
                height,
                format,
            },
        )
    }

    /// Current contents of a graphics object.
    pub fn graphics_contents(&self, object: GraphicsObject) -> Option<Vec<u8>> {
        self.state.lock().graphics.get(&object).map(|g| g.data.to_vec())
    }

    /// Whether any compute object wrapping `object` is currently acquired.
    pub fn is_acquired(&self, object: GraphicsObject) -> bool {
        self.state
            .lock()
            .mems
            .values()
            .any(|m| m.graphics == Some(object) && m.acquired)
    }

    pub fn stats(&self) -> HostStats {
        let state = self.state.lock();
        HostStats {
            builds: self.counters.builds.load(Ordering::Relaxed),
            kernel_submissions: self.counters.kernel_submissions.load(Ordering::Relaxed),
            transfers: self.counters.transfers.load(Ordering::Relaxed),
            acquires: self.counters.acquires.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            live_mem_objects: state.mems.len(),
            live_kernels: state.kernels.len(),
            live_programs: state.programs.len(),
            live_queues: state.queues.len(),
        }
    }

    fn device_handle(platform: usize, device: usize) -> DeviceHandle {
        DeviceHandle(((platform as u64 + 1) << 16) | device as u64)
    }

    fn device_spec(&self, handle: DeviceHandle) -> NativeResult<(usize, &HostDeviceSpec)> {
        let platform = (handle.0 >> 16).checked_sub(1).map(|p| p as usize);
        let device = (handle.0 & 0xffff) as usize;
        platform
            .and_then(|p| {
                self.platforms
                    .get(p)
                    .and_then(|spec| spec.devices.get(device))
                    .map(|spec| (p, spec))
            })
            .ok_or_else(|| {
                NativeError::new(Status::INVALID_DEVICE, format!("unknown device {}", handle.0))
            })
    }

    fn platform(&self, index: usize) -> NativeResult<&HostPlatformSpec> {
        self.platforms.get(index).ok_or_else(|| {
            NativeError::new(Status::INVALID_PLATFORM, format!("no platform #{index}"))
        })
    }

    fn count(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn set_acquired(&self, queue: QueueHandle, objects: &[MemHandle], acquire: bool) -> NativeResult<()> {
        let mut state = self.state.lock();
        state.queue(queue)?;
        for &mem in objects {
            let entry = state.mem(mem)?;
            if entry.graphics.is_none() {
                return fail(
                    Status::INVALID_GL_OBJECT,
                    format!("memory object {} is not graphics-shared", mem.0),
                );
            }
            if entry.acquired == acquire {
                let state_name = if acquire { "acquired" } else { "released" };
                return fail(
                    Status::INVALID_OPERATION,
                    format!("memory object {} is already {state_name}", mem.0),
                );
            }
        }
        for &mem in objects {
            state.mem_mut(mem)?.acquired = acquire;
        }
        Ok(())
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn platforms(&self) -> NativeResult<Vec<PlatformInfo>> {
        Ok(self
            .platforms
            .iter()
            .map(|p| PlatformInfo {
                name: p.name.clone(),
                vendor: p.vendor.clone(),
                version: p.version.clone(),
            })
            .collect())
    }

    fn devices(&self, platform: usize) -> NativeResult<Vec<NativeDeviceInfo>> {
        let spec = self.platform(platform)?;
        Ok(spec
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| d.to_info(Self::device_handle(platform, i)))
            .collect())
    }

    fn create_context(
        &self,
        platform: usize,
        devices: &[DeviceHandle],
        share_group: Option<ShareGroup>,
    ) -> NativeResult<ContextHandle> {
        let spec = self.platform(platform)?;
        if spec.fail_context_creation {
            return fail(
                Status::DEVICE_NOT_AVAILABLE,
                format!("platform '{}' refused the context", spec.name),
            );
        }
        if devices.is_empty() {
            return fail(Status::INVALID_VALUE, "context needs at least one device");
        }
        for &device in devices {
            let (owner, _) = self.device_spec(device)?;
            if owner != platform {
                return fail(
                    Status::INVALID_DEVICE,
                    format!("device {} is not on platform #{platform}", device.0),
                );
            }
        }

        let mut state = self.state.lock();
        if let Some(group) = share_group {
            if !state.share_groups.contains(&group) {
                return fail(
                    Status::INVALID_GL_SHAREGROUP_REFERENCE,
                    format!("unknown share-group {}", group.0),
                );
            }
        }
        let handle = ContextHandle(state.next());
        state.contexts.insert(
            handle,
            ContextEntry {
                platform,
                devices: devices.to_vec(),
                share_group,
            },
        );
        debug!("host context {} on platform #{platform} with {} device(s)", handle.0, devices.len());
        Ok(handle)
    }

    fn release_context(&self, context: ContextHandle) {
        self.state.lock().contexts.remove(&context);
    }

    fn create_queue(&self, context: ContextHandle, device: DeviceHandle) -> NativeResult<QueueHandle> {
        let mut state = self.state.lock();
        if !state.context(context)?.devices.contains(&device) {
            return fail(
                Status::INVALID_DEVICE,
                format!("device {} is not part of context {}", device.0, context.0),
            );
        }
        let handle = QueueHandle(state.next());
        let queue = HostQueue::spawn(format!("vcl-queue-{}", handle.0))?;
        state.queues.insert(
            handle,
            QueueEntry {
                context,
                device,
                queue: Arc::new(queue),
            },
        );
        Ok(handle)
    }

    fn release_queue(&self, queue: QueueHandle) {
        // Dropping the queue joins its worker, so do it outside the lock.
        let removed = self.state.lock().queues.remove(&queue);
        drop(removed);
    }

    fn supported_image_formats(&self, context: ContextHandle) -> NativeResult<Vec<ImageFormat>> {
        let platform = self.state.lock().context(context)?.platform;
        Ok(self.platform(platform)?.image_formats.clone())
    }

    fn build_program(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        source: &str,
        options: &str,
    ) -> Result<ProgramHandle, BuildFailure> {
        Self::count(&self.counters.builds, 1);
        let no_log = |error: NativeError| BuildFailure {
            error,
            log: String::new(),
        };

        let platform = {
            let state = self.state.lock();
            let ctx = state.context(context).map_err(no_log)?;
            if !ctx.devices.contains(&device) {
                return Err(no_log(NativeError::new(
                    Status::INVALID_DEVICE,
                    format!("device {} is not part of context {}", device.0, context.0),
                )));
            }
            ctx.platform
        };

        let defines = parse_defines(options);
        if let Some((line, text)) = live_error_directive(source, &defines) {
            return Err(BuildFailure {
                error: NativeError::new(Status::BUILD_PROGRAM_FAILURE, "program build failed"),
                log: format!("<source>:{line}: error: {text}"),
            });
        }
        let entries: HashMap<String, u32> = scan_kernels(source).into_iter().collect();

        let mut payload = Vec::new();
        let binary = if self.platform(platform).map_err(no_log)?.is_apple() {
            payload.extend_from_slice(&BITCODE_MAGIC);
            payload.extend_from_slice(source.as_bytes());
            wrap_bitcode(&payload)
        } else {
            payload.extend_from_slice(b"VCLHOST\n");
            payload.extend_from_slice(options.as_bytes());
            payload.push(b'\n');
            payload.extend_from_slice(source.as_bytes());
            payload
        };

        let mut state = self.state.lock();
        let handle = ProgramHandle(state.next());
        trace!("host program {} with {} entry point(s)", handle.0, entries.len());
        state.programs.insert(
            handle,
            ProgramEntry {
                device,
                entries,
                defines: Arc::new(defines),
                binary,
            },
        );
        Ok(handle)
    }

    fn program_binary(&self, program: ProgramHandle) -> NativeResult<Vec<u8>> {
        self.state
            .lock()
            .programs
            .get(&program)
            .map(|p| p.binary.clone())
            .ok_or_else(|| {
                NativeError::new(Status::INVALID_PROGRAM, format!("unknown program {}", program.0))
            })
    }

    fn release_program(&self, program: ProgramHandle) {
        self.state.lock().programs.remove(&program);
    }

    fn create_kernel(&self, program: ProgramHandle, entry_point: &str) -> NativeResult<NativeKernel> {
        let body = self.bodies.read().get(entry_point).cloned();
        let mut state = self.state.lock();
        let entry = state.programs.get(&program).ok_or_else(|| {
            NativeError::new(Status::INVALID_PROGRAM, format!("unknown program {}", program.0))
        })?;
        let Some(&arg_count) = entry.entries.get(entry_point) else {
            return fail(
                Status::INVALID_KERNEL_NAME,
                format!("no kernel named '{entry_point}' in program {}", program.0),
            );
        };
        let Some(body) = body else {
            return fail(
                Status::INVALID_KERNEL_DEFINITION,
                format!("no host implementation registered for '{entry_point}'"),
            );
        };
        let kernel = KernelEntry {
            name: entry_point.to_string(),
            device: entry.device,
            args: vec![None; arg_count as usize],
            defines: entry.defines.clone(),
            body,
        };
        let handle = NativeKernel(state.next());
        state.kernels.insert(handle, kernel);
        Ok(handle)
    }

    fn kernel_arg_count(&self, kernel: NativeKernel) -> NativeResult<u32> {
        Ok(self.state.lock().kernel_mut(kernel)?.args.len() as u32)
    }

    fn kernel_work_group_size(&self, kernel: NativeKernel, device: DeviceHandle) -> NativeResult<usize> {
        self.state.lock().kernel_mut(kernel)?;
        Ok(self.device_spec(device)?.1.max_work_group_size)
    }

    fn set_kernel_arg(&self, kernel: NativeKernel, index: u32, arg: KernelArg<'_>) -> NativeResult<()> {
        let mut state = self.state.lock();
        let value = match arg {
            KernelArg::Mem(mem) => {
                state.mem(mem)?;
                BoundArg::Mem(mem)
            }
            KernelArg::Bytes([]) => return fail(Status::INVALID_ARG_SIZE, "empty argument"),
            KernelArg::Bytes(bytes) => BoundArg::Bytes(bytes.to_vec()),
        };
        let entry = state.kernel_mut(kernel)?;
        match entry.args.get_mut(index as usize) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => fail(
                Status::INVALID_ARG_INDEX,
                format!("kernel '{}' has {} argument(s)", entry.name, entry.args.len()),
            ),
        }
    }

    fn release_kernel(&self, kernel: NativeKernel) {
        self.state.lock().kernels.remove(&kernel);
    }

    fn create_buffer(
        &self,
        context: ContextHandle,
        _access: MemAccess,
        mode: AllocMode,
        size: usize,
        host: Option<&HostMemory>,
    ) -> NativeResult<MemHandle> {
        if size == 0 {
            return fail(Status::INVALID_BUFFER_SIZE, "buffer size is zero");
        }
        let mut state = self.state.lock();
        let ctx = state.context(context)?;
        let max_alloc = ctx
            .devices
            .iter()
            .filter_map(|&d| self.device_spec(d).ok())
            .map(|(_, spec)| spec.max_alloc_size)
            .min()
            .unwrap_or(0);
        if size as u64 > max_alloc {
            return fail(
                Status::INVALID_BUFFER_SIZE,
                format!("{size} bytes exceeds the allocation limit of {max_alloc}"),
            );
        }
        let storage = backing(mode, size, host)?;
        let handle = MemHandle(state.next());
        state.mems.insert(
            handle,
            MemEntry {
                context,
                storage,
                image: None,
                graphics: None,
                parent: None,
                acquired: false,
                mapped: 0,
            },
        );
        Ok(handle)
    }

    fn create_sub_buffer(
        &self,
        parent: MemHandle,
        _access: MemAccess,
        offset: usize,
        size: usize,
    ) -> NativeResult<MemHandle> {
        let mut state = self.state.lock();
        let entry = state.mem(parent)?;
        if entry.parent.is_some() || entry.image.is_some() {
            return fail(
                Status::INVALID_MEM_OBJECT,
                "sub-buffers can only be created from plain buffers",
            );
        }
        if size == 0 {
            return fail(Status::INVALID_BUFFER_SIZE, "sub-buffer size is zero");
        }
        let Some(storage) = entry.storage.slice(offset, size) else {
            return fail(
                Status::INVALID_VALUE,
                format!("region {offset}+{size} outside parent of {} bytes", entry.storage.len),
            );
        };
        let context = entry.context;
        let handle = MemHandle(state.next());
        state.mems.insert(
            handle,
            MemEntry {
                context,
                storage,
                image: None,
                graphics: None,
                parent: Some(parent),
                acquired: false,
                mapped: 0,
            },
        );
        Ok(handle)
    }

    fn create_image(
        &self,
        context: ContextHandle,
        _access: MemAccess,
        mode: AllocMode,
        desc: &ImageDesc,
        host: Option<&HostMemory>,
    ) -> NativeResult<MemHandle> {
        let mut state = self.state.lock();
        let ctx = state.context(context)?;
        let capable: Vec<&HostDeviceSpec> = ctx
            .devices
            .iter()
            .filter_map(|&d| self.device_spec(d).ok())
            .map(|(_, spec)| spec)
            .filter(|spec| spec.image_support)
            .collect();
        if capable.is_empty() {
            return fail(Status::INVALID_OPERATION, "no device in the context supports images");
        }
        if !self.platform(ctx.platform)?.image_formats.contains(&desc.format) {
            return fail(
                Status::IMAGE_FORMAT_NOT_SUPPORTED,
                format!("format {} is not supported", desc.format),
            );
        }
        let [w, h, d] = desc.extent;
        for spec in &capable {
            let fits = match desc.image_type {
                ImageType::Image1D => w <= spec.image2d_max[0] && h == 1 && d == 1,
                ImageType::Image2D => w <= spec.image2d_max[0] && h <= spec.image2d_max[1] && d == 1,
                ImageType::Image3D => {
                    w <= spec.image3d_max[0] && h <= spec.image3d_max[1] && d <= spec.image3d_max[2]
                }
            };
            if !fits || w == 0 || h == 0 || d == 0 {
                return fail(
                    Status::INVALID_IMAGE_SIZE,
                    format!("extent {:?} not supported by '{}'", desc.extent, spec.name),
                );
            }
        }
        let storage = backing(mode, desc.byte_size(), host)?;
        let handle = MemHandle(state.next());
        state.mems.insert(
            handle,
            MemEntry {
                context,
                storage,
                image: Some(*desc),
                graphics: None,
                parent: None,
                acquired: false,
                mapped: 0,
            },
        );
        Ok(handle)
    }

    fn create_graphics_buffer(
        &self,
        context: ContextHandle,
        _access: MemAccess,
        object: GraphicsObject,
    ) -> NativeResult<(MemHandle, usize)> {
        let mut state = self.state.lock();
        let graphics = graphics_for(&state, context, object)?;
        let GraphicsKind::Buffer { size } = graphics.kind else {
            return fail(
                Status::INVALID_GL_OBJECT,
                format!("graphics object {} is not a buffer", object.0),
            );
        };
        let storage = Storage::whole(graphics.data.clone());
        let handle = MemHandle(state.next());
        state.mems.insert(
            handle,
            MemEntry {
                context,
                storage,
                image: None,
                graphics: Some(object),
                parent: None,
                acquired: false,
                mapped: 0,
            },
        );
        Ok((handle, size))
    }

    fn create_graphics_image(
        &self,
        context: ContextHandle,
        _access: MemAccess,
        object: GraphicsObject,
    ) -> NativeResult<(MemHandle, ImageDesc)> {
        let mut state = self.state.lock();
        let graphics = graphics_for(&state, context, object)?;
        let Some(desc) = graphics.kind.image_desc() else {
            return fail(
                Status::INVALID_GL_OBJECT,
                format!("graphics object {} is not an image", object.0),
            );
        };
        let storage = Storage::whole(graphics.data.clone());
        let handle = MemHandle(state.next());
        state.mems.insert(
            handle,
            MemEntry {
                context,
                storage,
                image: Some(desc),
                graphics: Some(object),
                parent: None,
                acquired: false,
                mapped: 0,
            },
        );
        Ok((handle, desc))
    }

    fn release_mem(&self, mem: MemHandle) {
        self.state.lock().mems.remove(&mem);
    }

    fn enqueue_write(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        src: &HostMemory,
        src_offset: usize,
        size: usize,
    ) -> NativeResult<()> {
        let (queue, storage, _) = self.state.lock().target(queue, mem)?;
        check_range(offset, size, storage.len, "write destination")?;
        check_range(src_offset, size, src.len(), "write source")?;
        Self::count(&self.counters.transfers, 1);
        let src = src.clone();
        queue.submit(blocking, move || {
            let bytes = src.read().get(src_offset..src_offset + size).map(<[u8]>::to_vec);
            match bytes {
                Some(bytes) if storage.write(offset, &bytes) => Ok(()),
                _ => fail(Status::OUT_OF_RESOURCES, "write range no longer valid"),
            }
        })
    }

    fn enqueue_read(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        dst: &HostMemory,
        dst_offset: usize,
    ) -> NativeResult<()> {
        let (queue, storage, _) = self.state.lock().target(queue, mem)?;
        check_range(offset, size, storage.len, "read source")?;
        check_range(dst_offset, size, dst.len(), "read destination")?;
        Self::count(&self.counters.transfers, 1);
        let dst = dst.clone();
        queue.submit(blocking, move || match storage.read(offset, size) {
            Some(bytes) if dst.fill_from(dst_offset, &bytes) => Ok(()),
            _ => fail(Status::OUT_OF_RESOURCES, "read range no longer valid"),
        })
    }

    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> NativeResult<()> {
        let (queue, from, to) = {
            let state = self.state.lock();
            let (queue_ref, from, _) = state.target(queue, src)?;
            let (_, to, _) = state.target(queue, dst)?;
            (queue_ref, from, to)
        };
        check_range(src_offset, size, from.len, "copy source")?;
        check_range(dst_offset, size, to.len, "copy destination")?;
        if from.data.ptr_eq(&to.data) {
            let a = from.offset + src_offset;
            let b = to.offset + dst_offset;
            if a < b + size && b < a + size {
                return fail(Status::MEM_COPY_OVERLAP, "copy regions overlap");
            }
        }
        Self::count(&self.counters.transfers, 1);
        queue.submit(false, move || match from.read(src_offset, size) {
            Some(bytes) if to.write(dst_offset, &bytes) => Ok(()),
            _ => fail(Status::OUT_OF_RESOURCES, "copy range no longer valid"),
        })
    }

    fn enqueue_write_image(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        src: &HostMemory,
    ) -> NativeResult<()> {
        let (queue, storage, desc) = self.state.lock().target(queue, mem)?;
        let Some(desc) = desc else {
            return fail(Status::INVALID_MEM_OBJECT, "not an image");
        };
        check_image_region(&desc, origin, region)?;
        let row = region[0] * desc.format.pixel_size();
        let rows = row_offsets(&desc, origin, region);
        check_range(0, row * rows.len(), src.len(), "image write source")?;
        Self::count(&self.counters.transfers, 1);
        let src = src.clone();
        queue.submit(blocking, move || {
            let bytes = src.to_vec();
            for (i, offset) in rows.into_iter().enumerate() {
                let written = bytes
                    .get(i * row..(i + 1) * row)
                    .is_some_and(|chunk| storage.write(offset, chunk));
                if !written {
                    return fail(Status::OUT_OF_RESOURCES, "image storage shrank");
                }
            }
            Ok(())
        })
    }

    fn enqueue_read_image(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        dst: &HostMemory,
    ) -> NativeResult<()> {
        let (queue, storage, desc) = self.state.lock().target(queue, mem)?;
        let Some(desc) = desc else {
            return fail(Status::INVALID_MEM_OBJECT, "not an image");
        };
        check_image_region(&desc, origin, region)?;
        let row = region[0] * desc.format.pixel_size();
        let rows = row_offsets(&desc, origin, region);
        check_range(0, row * rows.len(), dst.len(), "image read destination")?;
        Self::count(&self.counters.transfers, 1);
        let dst = dst.clone();
        queue.submit(blocking, move || {
            for (i, offset) in rows.into_iter().enumerate() {
                match storage.read(offset, row) {
                    Some(bytes) if dst.fill_from(i * row, &bytes) => {}
                    _ => return fail(Status::OUT_OF_RESOURCES, "image storage shrank"),
                }
            }
            Ok(())
        })
    }

    fn enqueue_copy_image(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
    ) -> NativeResult<()> {
        let (queue, from, from_desc, to, to_desc) = {
            let state = self.state.lock();
            let (queue_ref, from, from_desc) = state.target(queue, src)?;
            let (_, to, to_desc) = state.target(queue, dst)?;
            (queue_ref, from, from_desc, to, to_desc)
        };
        let (Some(from_desc), Some(to_desc)) = (from_desc, to_desc) else {
            return fail(Status::INVALID_MEM_OBJECT, "image copy between non-images");
        };
        if from_desc.format != to_desc.format {
            return fail(
                Status::IMAGE_FORMAT_MISMATCH,
                format!("{} vs {}", from_desc.format, to_desc.format),
            );
        }
        check_image_region(&from_desc, src_origin, region)?;
        check_image_region(&to_desc, dst_origin, region)?;
        let row = region[0] * from_desc.format.pixel_size();
        let src_rows = row_offsets(&from_desc, src_origin, region);
        let dst_rows = row_offsets(&to_desc, dst_origin, region);
        Self::count(&self.counters.transfers, 1);
        queue.submit(false, move || {
            for (s, d) in src_rows.into_iter().zip(dst_rows) {
                match from.read(s, row) {
                    Some(bytes) if to.write(d, &bytes) => {}
                    _ => return fail(Status::OUT_OF_RESOURCES, "image storage shrank"),
                }
            }
            Ok(())
        })
    }

    fn enqueue_map(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        size: usize,
        writable: bool,
    ) -> NativeResult<MappedRegion> {
        let (queue, storage) = {
            let mut state = self.state.lock();
            let (queue, storage, _) = state.target(queue, mem)?;
            check_range(offset, size, storage.len, "map")?;
            state.mem_mut(mem)?.mapped += 1;
            (queue, storage)
        };
        let data = HostMemory::zeroed(size);
        let view = data.clone();
        queue.submit(blocking, move || match storage.read(offset, size) {
            Some(bytes) if view.fill_from(0, &bytes) => Ok(()),
            _ => fail(Status::MAP_FAILURE, "mapped range no longer valid"),
        })?;
        Ok(MappedRegion {
            mem,
            offset,
            size,
            writable,
            data,
        })
    }

    fn enqueue_unmap(&self, queue: QueueHandle, region: MappedRegion) -> NativeResult<()> {
        let (queue, storage) = {
            let mut state = self.state.lock();
            let (queue, storage, _) = state.target(queue, region.mem)?;
            let entry = state.mem_mut(region.mem)?;
            if entry.mapped == 0 {
                return fail(
                    Status::INVALID_VALUE,
                    format!("memory object {} is not mapped", region.mem.0),
                );
            }
            entry.mapped -= 1;
            (queue, storage)
        };
        if !region.writable {
            return Ok(());
        }
        queue.submit(false, move || {
            if storage.write(region.offset, &region.data.to_vec()) {
                Ok(())
            } else {
                fail(Status::OUT_OF_RESOURCES, "unmapped range no longer valid")
            }
        })
    }

    fn enqueue_acquire_graphics(&self, queue: QueueHandle, objects: &[MemHandle]) -> NativeResult<()> {
        self.set_acquired(queue, objects, true)?;
        Self::count(&self.counters.acquires, objects.len() as u64);
        Ok(())
    }

    fn enqueue_release_graphics(&self, queue: QueueHandle, objects: &[MemHandle]) -> NativeResult<()> {
        self.set_acquired(queue, objects, false)?;
        Self::count(&self.counters.releases, objects.len() as u64);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: NativeKernel,
        grid: &ExecutionGrid,
    ) -> NativeResult<()> {
        let (queue, job_args, body, defines, name, device_type) = {
            let state = self.state.lock();
            let q = state.queue(queue)?;
            let k = state.kernels.get(&kernel).ok_or_else(|| {
                NativeError::new(Status::INVALID_KERNEL, format!("unknown kernel {}", kernel.0))
            })?;
            if k.device != q.device {
                return fail(
                    Status::INVALID_PROGRAM_EXECUTABLE,
                    format!("kernel '{}' was not built for this queue's device", k.name),
                );
            }
            let (_, spec) = self.device_spec(q.device)?;
            grid.check(spec.max_work_item_sizes, spec.max_work_group_size)
                .map_err(|detail| NativeError::new(Status::INVALID_WORK_GROUP_SIZE, detail))?;

            let mut job_args = Vec::with_capacity(k.args.len());
            for (index, slot) in k.args.iter().enumerate() {
                match slot {
                    None => {
                        return fail(
                            Status::INVALID_KERNEL_ARGS,
                            format!("kernel '{}' argument #{index} is not set", k.name),
                        )
                    }
                    Some(BoundArg::Bytes(bytes)) => job_args.push(HostArg::Bytes(bytes.clone())),
                    Some(BoundArg::Mem(mem)) => {
                        let entry = state.mem(*mem)?;
                        if entry.graphics.is_some() && !entry.acquired {
                            return fail(
                                Status::INVALID_GL_OBJECT,
                                format!(
                                    "kernel '{}' argument #{index} is a graphics object that was not acquired",
                                    k.name
                                ),
                            );
                        }
                        job_args.push(HostArg::Mem(entry.storage.clone()));
                    }
                }
            }
            (
                q.queue.clone(),
                job_args,
                k.body.clone(),
                k.defines.clone(),
                k.name.clone(),
                spec.device_type,
            )
        };

        Self::count(&self.counters.kernel_submissions, 1);
        trace!("submitting '{name}' over {:?}", grid.global);
        let grid = *grid;
        queue.submit(false, move || {
            let mut invocation = HostInvocation {
                grid,
                args: &job_args,
                defines: &defines,
                device_type,
            };
            body(&mut invocation).map_err(|detail| {
                NativeError::new(Status::OUT_OF_RESOURCES, format!("kernel '{name}': {detail}"))
            })
        })
    }

    fn flush(&self, queue: QueueHandle) -> NativeResult<()> {
        self.state.lock().queue(queue).map(|_| ())
    }

    fn finish(&self, queue: QueueHandle) -> NativeResult<()> {
        let queue = self.state.lock().queue(queue)?.queue.clone();
        queue.finish()
    }
}

fn graphics_for(
    state: &HostState,
    context: ContextHandle,
    object: GraphicsObject,
) -> NativeResult<GraphicsEntry> {
    let Some(group) = state.context(context)?.share_group else {
        return fail(
            Status::INVALID_CONTEXT,
            format!("context {} has no graphics share-group", context.0),
        );
    };
    match state.graphics.get(&object) {
        Some(entry) if entry.group == group => Ok(entry.clone()),
        Some(_) => fail(
            Status::INVALID_GL_OBJECT,
            format!("graphics object {} belongs to another share-group", object.0),
        ),
        None => fail(
            Status::INVALID_GL_OBJECT,
            format!("unknown graphics object {}", object.0),
        ),
    }
}
