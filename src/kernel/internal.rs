//! Kernels the runtime builds for itself, and helpers dispatching them.

use super::KernelId;
use crate::error::{Error, Result};
use crate::memory::BufferId;
use crate::runtime::Runtime;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalKernel {
    pub identifier: &'static str,
    /// Name under [`BuiltinSources`](crate::source::BuiltinSources).
    pub file: &'static str,
    pub entry: &'static str,
    /// Defines baked into this kernel's build.
    pub options: &'static str,
}

/// Built at start-up and by every reload, in this order.
pub const INTERNAL_KERNELS: &[InternalKernel] = &[
    InternalKernel {
        identifier: "vcl.fill_u32",
        file: "fill.cl",
        entry: "fill_u32",
        options: "-DFILL_BATCH=4",
    },
    InternalKernel {
        identifier: "vcl.copy_bytes",
        file: "copy.cl",
        entry: "copy_bytes",
        options: "-DCOPY_TILE=16",
    },
    InternalKernel {
        identifier: "vcl.scale_f32",
        file: "scale.cl",
        entry: "scale_f32",
        options: "",
    },
];

const FILL_BATCH: usize = 4;
const COPY_TILE: usize = 16;

impl Runtime {
    /// Build every internal kernel; returns whether all succeeded.
    pub(crate) fn compile_internal_kernels(&self) -> bool {
        let mut success = true;
        for internal in INTERNAL_KERNELS {
            if let Err(err) = self.compile_internal(internal) {
                warn!("internal kernel '{}' failed to build: {err}", internal.identifier);
                success = false;
            }
        }
        success
    }

    fn internal_id(&self, identifier: &'static str) -> Result<KernelId> {
        self.kernel_id(identifier)
            .ok_or(Error::InvalidHandle("internal kernel"))
    }

    /// Set the first `count` 32-bit words of `buffer` to `value`.
    pub fn fill_u32(&self, buffer: BufferId, value: u32, count: u32) -> Result<()> {
        let id = self.internal_id("vcl.fill_u32")?;
        self.bind_buffer(id, 0, buffer)?;
        self.bind_scalar(id, 1, value)?;
        self.bind_scalar(id, 2, count)?;
        self.compute_execution_grid_1d(id, (count as usize).div_ceil(FILL_BATCH))?;
        self.dispatch(id)
    }

    /// Copy the first `count` bytes of `src` into `dst`.
    pub fn copy_bytes(&self, src: BufferId, dst: BufferId, count: u32) -> Result<()> {
        let id = self.internal_id("vcl.copy_bytes")?;
        self.bind_buffer(id, 0, src)?;
        self.bind_buffer(id, 1, dst)?;
        self.bind_scalar(id, 2, count)?;
        self.compute_execution_grid_1d(id, (count as usize).div_ceil(COPY_TILE))?;
        self.dispatch(id)
    }

    /// Multiply the first `count` floats of `buffer` by `factor`.
    pub fn scale_f32(&self, buffer: BufferId, factor: f32, count: u32) -> Result<()> {
        let id = self.internal_id("vcl.scale_f32")?;
        self.bind_buffer(id, 0, buffer)?;
        self.bind_scalar(id, 1, factor)?;
        self.bind_scalar(id, 2, count)?;
        self.compute_execution_grid_1d(id, count as usize)?;
        self.dispatch(id)
    }
}
