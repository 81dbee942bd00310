//! Argument binding, execution grids and kernel dispatch.

pub mod binder;
pub mod grid;

pub use grid::{grid_1d, grid_2d, grid_3d, ExecutionGrid};

use crate::context::ComputeContext;
use crate::driver::{MemHandle, NativeError, QueueHandle};
use crate::error::{Error, Result};
use crate::kernel::registry::RegistryGuard;
use crate::kernel::{DispatchDescriptor, KernelId};
use crate::memory::{BufferId, HostMemory, MemFlags};
use crate::runtime::Runtime;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// What dispatch needs to know about one bound memory object.
#[derive(Debug)]
struct BoundObject {
    id: BufferId,
    handle: MemHandle,
    size: usize,
    flags: MemFlags,
    host: Option<HostMemory>,
}

fn dispatch_error(kernel: &str, step: &str, source: NativeError) -> Error {
    error!("dispatch of '{kernel}': {step} failed: {source}");
    Error::Dispatch {
        kernel: kernel.to_string(),
        source,
    }
}

impl Runtime {
    /// Preferred work-group size on the active device and its work-item
    /// limits.
    fn grid_limits(&self, kernel: KernelId) -> Result<(usize, [usize; 3])> {
        let ctx = self.ctx()?;
        let device = ctx
            .active_device()
            .ok_or_else(|| Error::invalid_argument("no active device"))?;
        self.registry.with(|state| {
            let k = state.get(kernel).ok_or(Error::InvalidHandle("kernel"))?;
            let preferred = k
                .build_for(device.handle)
                .map_or(device.max_work_group_size, |b| b.work_group_size);
            Ok((preferred, device.max_work_item_sizes))
        })
    }

    /// Set the grid used by later dispatches of `kernel`.
    pub fn set_execution_grid(&self, kernel: KernelId, grid: ExecutionGrid) -> Result<()> {
        self.registry.with(|state| {
            let k = state.get_mut(kernel).ok_or(Error::InvalidHandle("kernel"))?;
            k.grid = Some(grid);
            Ok(())
        })
    }

    /// Size and store a one-dimensional grid covering `problem` items.
    pub fn compute_execution_grid_1d(&self, kernel: KernelId, problem: usize) -> Result<ExecutionGrid> {
        let (preferred, max_items) = self.grid_limits(kernel)?;
        let grid = grid_1d(problem, preferred, max_items)?;
        self.set_execution_grid(kernel, grid)?;
        Ok(grid)
    }

    pub fn compute_execution_grid_2d(
        &self,
        kernel: KernelId,
        problem: [usize; 2],
    ) -> Result<ExecutionGrid> {
        let (preferred, max_items) = self.grid_limits(kernel)?;
        let grid = grid_2d(problem, preferred, max_items)?;
        self.set_execution_grid(kernel, grid)?;
        Ok(grid)
    }

    pub fn compute_execution_grid_3d(
        &self,
        kernel: KernelId,
        problem: [usize; 3],
    ) -> Result<ExecutionGrid> {
        let (preferred, max_items) = self.grid_limits(kernel)?;
        let grid = grid_3d(problem, preferred, max_items)?;
        self.set_execution_grid(kernel, grid)?;
        Ok(grid)
    }

    /// Run `kernel` on the active device's queue.
    ///
    /// Every argument must be bound. Around the submission, in order:
    /// copy-on-use objects are written from their host data, automatically
    /// shared graphics objects are acquired, read-back objects are read into
    /// their host data, delete-after-use objects are deleted, and the
    /// acquired graphics objects are released.
    pub fn dispatch(&self, kernel: KernelId) -> Result<()> {
        let ctx = self.ctx()?;
        let started = Instant::now();
        let result = self.dispatch_on_active(ctx, kernel);
        match &result {
            Ok(()) => self.metrics.record_dispatch(started.elapsed()),
            Err(_) => self.metrics.record_dispatch_failure(),
        }
        result
    }

    /// Fan one dispatch out over every context device.
    pub fn dispatch_on_all(&self, _kernel: KernelId) -> Result<()> {
        self.ctx()?;
        warn!("multi-device dispatch requested");
        Err(Error::Unimplemented("multi-device dispatch"))
    }

    fn dispatch_on_active(&self, ctx: &ComputeContext, kernel: KernelId) -> Result<()> {
        let device = ctx
            .active_device()
            .ok_or_else(|| Error::invalid_argument("no active device"))?;
        let queue = ctx.active_queue()?;
        let registry = self.registry.lock();

        let (name, native, grid, ids) = {
            let state = registry.borrow();
            let k = state.get(kernel).ok_or(Error::InvalidHandle("kernel"))?;
            if !k.valid {
                return Err(Error::invariant(format!("kernel '{}' is not valid", k.identifier)));
            }
            if let Some(index) = k.first_missing() {
                error!("dispatch of '{}': argument #{index} was never bound", k.identifier);
                return Err(Error::MissingArgument {
                    kernel: k.identifier.clone(),
                    index,
                });
            }
            let build = k.build_for(device.handle).ok_or_else(|| {
                Error::invariant(format!("kernel '{}' has no build for {device}", k.identifier))
            })?;
            let grid = k.grid.ok_or_else(|| {
                Error::invalid_argument(format!("kernel '{}' has no execution grid", k.identifier))
            })?;
            let mut ids: Vec<BufferId> = k.bound.iter().flatten().copied().collect();
            ids.sort();
            ids.dedup();
            (k.identifier.clone(), build.kernel, grid, ids)
        };

        let objects: Vec<BoundObject> = {
            let objects = self.memory.lock();
            ids.iter()
                .map(|&id| {
                    let object = crate::memory::model::get(&objects, id)?;
                    Ok(BoundObject {
                        id,
                        handle: object.handle,
                        size: object.size,
                        flags: *object.flags.get(),
                        host: object.host.clone(),
                    })
                })
                .collect::<Result<_>>()?
        };
        let driver = ctx.driver();

        // 1. copy-on-use
        for object in objects.iter().filter(|o| o.flags.copy_on_use) {
            if let Some(host) = &object.host {
                let size = object.size.min(host.len());
                driver
                    .enqueue_write(queue, object.handle, object.flags.block_write, 0, host, 0, size)
                    .map_err(|source| dispatch_error(&name, "copy-on-use write", source))?;
                self.metrics.record_transfer(size);
            }
        }

        // 2. automatically shared graphics objects
        let shared: Vec<MemHandle> = objects
            .iter()
            .filter(|o| o.flags.graphics_shared && !o.flags.manual_graphics_sharing)
            .map(|o| o.handle)
            .collect();
        if let Some(k) = registry.borrow_mut().get_mut(kernel) {
            k.has_graphics_args = !shared.is_empty();
        }

        // 3. acquire
        if !shared.is_empty() {
            driver
                .enqueue_acquire_graphics(queue, &shared)
                .map_err(|source| dispatch_error(&name, "graphics acquire", source))?;
        }

        // 4. submit through the per-queue descriptor
        let descriptor = self.descriptor(&registry, kernel, queue, native, grid)?;
        if let Err(source) = driver.enqueue_kernel(queue, descriptor.kernel, &descriptor.grid) {
            if !shared.is_empty() {
                if let Err(err) = driver.enqueue_release_graphics(queue, &shared) {
                    warn!("releasing graphics objects after a failed dispatch failed: {err}");
                }
            }
            return Err(dispatch_error(&name, "submission", source));
        }
        if let Some(k) = registry.borrow_mut().get_mut(kernel) {
            k.dispatch_count += 1;
        }
        trace!(
            "'{name}' submitted on queue {} ({} items, group {})",
            queue.0,
            grid.work_items(),
            grid.group_size()
        );

        // 5 and 6, then 7 whatever happened
        let mut released = Vec::new();
        let after = self.read_back_and_delete(ctx, &registry, &name, queue, &objects, &shared, &mut released);
        let remaining: Vec<MemHandle> = shared
            .iter()
            .copied()
            .filter(|h| !released.contains(h))
            .collect();
        let release = if remaining.is_empty() {
            Ok(())
        } else {
            driver
                .enqueue_release_graphics(queue, &remaining)
                .map_err(|source| dispatch_error(&name, "graphics release", source))
        };
        after.and(release)
    }

    fn descriptor(
        &self,
        registry: &RegistryGuard<'_>,
        kernel: KernelId,
        queue: QueueHandle,
        native: crate::driver::NativeKernel,
        grid: ExecutionGrid,
    ) -> Result<DispatchDescriptor> {
        let mut state = registry.borrow_mut();
        let k = state.get_mut(kernel).ok_or(Error::InvalidHandle("kernel"))?;
        if !k.descriptors.contains_key(&queue) {
            debug!("new dispatch descriptor for '{}' on queue {}", k.identifier, queue.0);
        }
        let descriptor = k.descriptors.entry(queue).or_insert(DispatchDescriptor {
            kernel: native,
            grid,
            submissions: 0,
        });
        descriptor.grid = grid;
        descriptor.submissions += 1;
        Ok(*descriptor)
    }

    #[allow(clippy::too_many_arguments)]
    fn read_back_and_delete(
        &self,
        ctx: &ComputeContext,
        registry: &RegistryGuard<'_>,
        name: &str,
        queue: QueueHandle,
        objects: &[BoundObject],
        shared: &[MemHandle],
        released: &mut Vec<MemHandle>,
    ) -> Result<()> {
        let driver = ctx.driver();

        // 5. read-back; a buffer about to be deleted is read synchronously
        for object in objects.iter().filter(|o| o.flags.read_back) {
            if let Some(host) = &object.host {
                let size = object.size.min(host.len());
                let blocking = object.flags.block_read || object.flags.delete_after_use;
                driver
                    .enqueue_read(queue, object.handle, blocking, 0, size, host, 0)
                    .map_err(|source| dispatch_error(name, "read-back", source))?;
                self.metrics.record_transfer(size);
            }
        }

        // 6. delete-after-use
        for object in objects.iter().filter(|o| o.flags.delete_after_use) {
            if shared.contains(&object.handle) {
                driver
                    .enqueue_release_graphics(queue, &[object.handle])
                    .map_err(|source| dispatch_error(name, "graphics release", source))?;
                released.push(object.handle);
            }
            // A parent deleted earlier in this loop takes its sub-buffers along.
            if self.contains_buffer(object.id) {
                self.delete_buffer_locked(ctx, registry, object.id)?;
            }
        }
        Ok(())
    }
}
