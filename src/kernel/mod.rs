//! Kernel compilation and the kernel registry.
//!
//! A kernel is built once per context device and registered under a caller
//! chosen identifier. Callers hold [`KernelId`]s; deleting a kernel makes
//! every outstanding id stale.

pub mod binary;
pub mod compiler;
pub mod internal;
pub(crate) mod registry;

pub use internal::{InternalKernel, INTERNAL_KERNELS};

use crate::dispatch::ExecutionGrid;
use crate::driver::{DeviceHandle, NativeKernel, ProgramHandle, QueueHandle};
use crate::error::{Error, Result};
use crate::events::RuntimeEvent;
use crate::memory::BufferId;
use crate::runtime::Runtime;
use crate::source::BuiltinSources;
use crate::util::slab::Key;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Handle to a registered kernel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) Key);

impl fmt::Debug for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelId({:?})", self.0)
    }
}

/// The native objects of one kernel on one device.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DeviceBuild {
    pub(crate) device: DeviceHandle,
    pub(crate) device_index: usize,
    pub(crate) program: ProgramHandle,
    pub(crate) kernel: NativeKernel,
    pub(crate) arg_count: u32,
    pub(crate) work_group_size: usize,
}

/// Cached submission state for one (kernel, queue) pair. Created on the
/// first dispatch to the queue; later dispatches only update the grid.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DispatchDescriptor {
    pub(crate) kernel: NativeKernel,
    pub(crate) grid: ExecutionGrid,
    pub(crate) submissions: u64,
}

#[derive(Debug)]
pub(crate) struct KernelObject {
    pub(crate) identifier: String,
    pub(crate) entry: String,
    pub(crate) options: String,
    pub(crate) builds: Vec<DeviceBuild>,
    pub(crate) arg_count: u32,
    pub(crate) args_passed: Vec<bool>,
    pub(crate) bound: Vec<Option<BufferId>>,
    pub(crate) descriptors: HashMap<QueueHandle, DispatchDescriptor>,
    pub(crate) valid: bool,
    pub(crate) grid: Option<ExecutionGrid>,
    pub(crate) has_graphics_args: bool,
    pub(crate) dispatch_count: u64,
}

impl KernelObject {
    pub(crate) fn new(identifier: &str, entry: &str, options: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            entry: entry.to_string(),
            options: options.to_string(),
            builds: Vec::new(),
            arg_count: 0,
            args_passed: Vec::new(),
            bound: Vec::new(),
            descriptors: HashMap::new(),
            valid: false,
            grid: None,
            has_graphics_args: false,
            dispatch_count: 0,
        }
    }

    pub(crate) fn with_builds(mut self, builds: Vec<DeviceBuild>, arg_count: u32) -> Self {
        self.builds = builds;
        self.arg_count = arg_count;
        self.args_passed = vec![false; arg_count as usize];
        self.bound = vec![None; arg_count as usize];
        self.valid = true;
        self
    }

    pub(crate) fn build_for(&self, device: DeviceHandle) -> Option<&DeviceBuild> {
        self.builds.iter().find(|b| b.device == device)
    }

    /// First argument never bound.
    pub(crate) fn first_missing(&self) -> Option<u32> {
        self.args_passed.iter().position(|&p| !p).map(|i| i as u32)
    }

    /// Forget whatever is bound at `index`.
    pub(crate) fn unbind(&mut self, index: u32) {
        let i = index as usize;
        if let Some(slot) = self.bound.get_mut(i) {
            *slot = None;
        }
        if let Some(passed) = self.args_passed.get_mut(i) {
            *passed = false;
        }
    }

    fn info(&self, id: KernelId) -> KernelInfo {
        KernelInfo {
            id,
            identifier: self.identifier.clone(),
            entry: self.entry.clone(),
            arg_count: self.arg_count,
            args_passed: self.args_passed.clone(),
            bound_buffers: self.bound.clone(),
            devices: self.builds.len(),
            work_group_sizes: self.builds.iter().map(|b| b.work_group_size).collect(),
            valid: self.valid,
            grid: self.grid,
            has_graphics_args: self.has_graphics_args,
            dispatch_count: self.dispatch_count,
            cached_descriptors: self.descriptors.len(),
        }
    }
}

/// A snapshot of one registered kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInfo {
    pub id: KernelId,
    pub identifier: String,
    pub entry: String,
    pub arg_count: u32,
    pub args_passed: Vec<bool>,
    pub bound_buffers: Vec<Option<BufferId>>,
    pub devices: usize,
    /// Preferred work-group size per device build.
    pub work_group_sizes: Vec<usize>,
    pub valid: bool,
    pub grid: Option<ExecutionGrid>,
    pub has_graphics_args: bool,
    pub dispatch_count: u64,
    pub cached_descriptors: usize,
}

impl Runtime {
    /// Build `entry_point` from `source` for every device and register it
    /// as `identifier`. An identifier already registered returns the
    /// existing kernel without building.
    pub fn compile(
        &self,
        identifier: &str,
        source: &str,
        entry_point: &str,
        options: &str,
    ) -> Result<KernelId> {
        let ctx = self.ctx()?;
        let registry = self.registry.lock();
        if let Some(&id) = registry.borrow().by_name.get(identifier) {
            warn!("kernel '{identifier}' already registered, reusing it");
            return Ok(id);
        }

        let built = compiler::build_all(ctx, &self.config, identifier, source, entry_point, options);
        self.metrics.record_build(built.is_ok());
        let built = built?;

        let kernel = KernelObject::new(identifier, entry_point, options)
            .with_builds(built.builds, built.arg_count);
        let id = registry.borrow_mut().insert(kernel);
        info!("kernel '{identifier}' registered as {id:?}");
        Ok(id)
    }

    /// Read `path` through the source loader and compile it.
    pub fn compile_file<P: AsRef<Path>>(
        &self,
        identifier: &str,
        path: P,
        entry_point: &str,
        options: &str,
    ) -> Result<KernelId> {
        self.ctx()?;
        let path = path.as_ref();
        let source = self.sources.load(path).map_err(|err| {
            warn!("reading kernel source {} failed: {err}", path.display());
            err
        })?;
        self.compile(identifier, &source, entry_point, options)
    }

    /// Drop every kernel and rebuild the internal ones. Always emits
    /// [`RuntimeEvent::KernelsReloaded`]; returns whether every build
    /// succeeded.
    pub fn reload_all(&self) -> Result<bool> {
        let ctx = self.ctx()?;
        let registry = self.registry.lock();
        let ids = registry.borrow().ids();
        for id in &ids {
            self.destroy_kernel_locked(ctx, &registry, *id);
        }
        registry.borrow_mut().current = None;

        let mut success = true;
        for internal in INTERNAL_KERNELS {
            if let Err(err) = self.compile_internal(internal) {
                warn!("internal kernel '{}' failed to rebuild: {err}", internal.identifier);
                success = false;
            }
        }
        drop(registry);

        self.events.emit(RuntimeEvent::KernelsReloaded {
            timestamp: SystemTime::now(),
            success,
        });
        info!(
            "reloaded kernels: {} dropped, {} internal rebuilt, success={success}",
            ids.len(),
            INTERNAL_KERNELS.len()
        );
        Ok(success)
    }

    pub(crate) fn compile_internal(&self, internal: &InternalKernel) -> Result<KernelId> {
        let source = BuiltinSources::get(internal.file).ok_or_else(|| {
            Error::invariant(format!("built-in source '{}' is missing", internal.file))
        })?;
        self.compile(internal.identifier, source, internal.entry, internal.options)
    }

    /// Remove a kernel. Drains the active queue first when it is the
    /// current kernel, and unbinds it from every buffer.
    pub fn delete_kernel(&self, id: KernelId) -> Result<()> {
        let ctx = self.ctx()?;
        let registry = self.registry.lock();
        let (exists, current) = {
            let state = registry.borrow();
            (state.get(id).is_some(), state.current == Some(id))
        };
        if !exists {
            return Err(Error::InvalidHandle("kernel"));
        }
        if current {
            if let Err(err) = ctx.finish() {
                warn!("draining before deleting the current kernel failed: {err}");
            }
        }
        self.destroy_kernel_locked(ctx, &registry, id);
        Ok(())
    }

    pub(crate) fn destroy_kernel_locked(
        &self,
        ctx: &crate::context::ComputeContext,
        registry: &registry::RegistryGuard<'_>,
        id: KernelId,
    ) {
        self.memory.dissociate_kernel_everywhere(id);
        let removed = registry.borrow_mut().remove(id);
        if let Some(kernel) = removed {
            compiler::release_builds(ctx.driver().as_ref(), &kernel.builds);
            debug!("kernel '{}' destroyed", kernel.identifier);
        }
    }

    pub fn kernel_id(&self, identifier: &str) -> Option<KernelId> {
        self.registry.with(|state| state.by_name.get(identifier).copied())
    }

    pub fn kernel_info(&self, id: KernelId) -> Result<KernelInfo> {
        self.registry.with(|state| {
            state
                .get(id)
                .map(|k| k.info(id))
                .ok_or(Error::InvalidHandle("kernel"))
        })
    }

    /// Make `id` the current kernel.
    pub fn use_kernel(&self, id: KernelId) -> Result<()> {
        self.registry.with(|state| {
            if state.get(id).is_none() {
                return Err(Error::InvalidHandle("kernel"));
            }
            state.current = Some(id);
            Ok(())
        })
    }

    pub fn current_kernel(&self) -> Option<KernelId> {
        self.registry.with(|state| state.current)
    }

    pub fn kernel_count(&self) -> usize {
        self.registry.with(|state| state.kernels.len())
    }
}
