//! Kernel argument binding.
//!
//! An argument is set on every device build of the kernel. The runtime's
//! own bookkeeping (passed bits, bound buffers, buffer associations) only
//! changes once every native call succeeded.

use crate::driver::{KernelArg, NativeError};
use crate::error::{Error, Result};
use crate::kernel::{DeviceBuild, KernelId};
use crate::memory::BufferId;
use crate::runtime::Runtime;
use tracing::{error, trace};

struct Slot {
    identifier: String,
    builds: Vec<DeviceBuild>,
    previous: Option<BufferId>,
}

fn binding_error(kernel: &str, index: u32, size: usize, reason: impl Into<String>) -> Error {
    let reason = reason.into();
    error!("kernel '{kernel}': binding argument #{index} ({size} bytes) failed: {reason}");
    Error::ArgumentBinding {
        kernel: kernel.to_string(),
        index,
        size,
        reason,
    }
}

impl Runtime {
    fn slot(&self, kernel: KernelId, index: u32, size: usize) -> Result<Slot> {
        self.registry.with(|state| {
            let k = state.get(kernel).ok_or(Error::InvalidHandle("kernel"))?;
            if index >= k.arg_count {
                return Err(binding_error(
                    &k.identifier,
                    index,
                    size,
                    format!("kernel declares {} argument(s)", k.arg_count),
                ));
            }
            Ok(Slot {
                identifier: k.identifier.clone(),
                builds: k.builds.clone(),
                previous: k.bound.get(index as usize).copied().flatten(),
            })
        })
    }

    fn set_on_all(&self, slot: &Slot, index: u32, arg: KernelArg<'_>) -> Result<()> {
        let ctx = self.ctx()?;
        for build in &slot.builds {
            ctx.driver()
                .set_kernel_arg(build.kernel, index, arg)
                .map_err(|status: NativeError| {
                    binding_error(&slot.identifier, index, arg.size(), status.to_string())
                })?;
        }
        Ok(())
    }

    /// Bind a memory object to argument `index`.
    pub fn bind_buffer(&self, kernel: KernelId, index: u32, buffer: BufferId) -> Result<()> {
        self.ctx()?;
        let registry = self.registry.lock();
        let size = std::mem::size_of::<crate::driver::MemHandle>();
        let slot = self.slot(kernel, index, size)?;
        let handle = self
            .memory
            .with(buffer, |object| object.handle)
            .map_err(|_| binding_error(&slot.identifier, index, size, format!("{buffer} does not exist")))?;

        self.set_on_all(&slot, index, KernelArg::Mem(handle))?;

        {
            let mut objects = self.memory.lock();
            if let Some(previous) = slot.previous.filter(|&p| p != buffer) {
                if let Some(object) = objects.get_mut(previous.0) {
                    object.dissociate(kernel, index);
                }
            }
            if let Some(object) = objects.get_mut(buffer.0) {
                object.associate(kernel, index);
            }
        }
        let mut state = registry.borrow_mut();
        if let Some(k) = state.get_mut(kernel) {
            k.bound[index as usize] = Some(buffer);
            k.args_passed[index as usize] = true;
        }
        trace!("kernel '{}' argument #{index} <- {buffer}", slot.identifier);
        Ok(())
    }

    /// Bind raw bytes to argument `index`, replacing any bound buffer.
    pub fn bind_bytes(&self, kernel: KernelId, index: u32, bytes: &[u8]) -> Result<()> {
        self.ctx()?;
        let registry = self.registry.lock();
        let slot = self.slot(kernel, index, bytes.len())?;
        if bytes.is_empty() {
            return Err(binding_error(&slot.identifier, index, 0, "empty argument value"));
        }

        self.set_on_all(&slot, index, KernelArg::Bytes(bytes))?;

        if let Some(previous) = slot.previous {
            if let Some(object) = self.memory.lock().get_mut(previous.0) {
                object.dissociate(kernel, index);
            }
        }
        let mut state = registry.borrow_mut();
        if let Some(k) = state.get_mut(kernel) {
            k.bound[index as usize] = None;
            k.args_passed[index as usize] = true;
        }
        Ok(())
    }

    /// Bind a plain-old-data value to argument `index`.
    pub fn bind_scalar<T: bytemuck::Pod>(&self, kernel: KernelId, index: u32, value: T) -> Result<()> {
        self.bind_bytes(kernel, index, bytemuck::bytes_of(&value))
    }
}
