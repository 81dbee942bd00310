use crate::config::Config;
use crate::context::{ComputeContext, ContextOptions};
use crate::device::{Device, DeviceSelector};
use crate::driver::host::HostDriver;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::kernel::registry::KernelRegistry;
use crate::memory::model::MemoryModel;
use crate::source::{FsSourceLoader, SourceLoader};
use crate::telemetry::{Metrics, MetricsSnapshot};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use tracing::{error, info, warn};

/// One compute runtime: the device catalog and context, the kernel
/// registry and the memory objects, torn down in reverse order on drop.
///
/// Binding and dispatch are not synchronized against each other. Callers
/// sharing a runtime across threads bracket each bind-and-dispatch sequence
/// with [`acquire`](Runtime::acquire).
pub struct Runtime {
    pub(crate) config: Config,
    pub(crate) context: Option<ComputeContext>,
    pub(crate) registry: KernelRegistry,
    pub(crate) memory: MemoryModel,
    pub(crate) sources: Arc<dyn SourceLoader>,
    pub(crate) events: EventBus,
    pub(crate) metrics: Metrics,
    external: Mutex<()>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.context)
            .field("kernels", &self.kernel_count())
            .field("buffers", &self.memory.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// A runtime over this machine's host platform.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_driver(config, Arc::new(HostDriver::system()))
    }

    /// A runtime over the platforms `driver` exposes.
    pub fn with_driver(config: Config, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate()?;

        let options = ContextOptions {
            platform: config.platform_index,
            use_platform_devices: config.use_platform_devices,
            restriction: config.device_restriction,
            share_group: config.graphics_sharing,
            host_fallback: config.host_fallback,
        };
        let context = match ComputeContext::create(driver, &options) {
            Ok(context) => Some(context),
            Err(err) if config.require_device => {
                error!("no usable compute device: {err}");
                return Err(err);
            }
            Err(err) => {
                warn!("compute runtime unsupported: {err}");
                None
            }
        };
        if let Some(context) = &context {
            context.set_active_device(config.active_device);
        }

        #[cfg(feature = "telemetry")]
        let metrics = if config.enable_telemetry {
            Metrics::new()
        } else {
            Metrics::disabled()
        };
        #[cfg(not(feature = "telemetry"))]
        let metrics = Metrics::new();

        let runtime = Self {
            sources: Arc::new(FsSourceLoader::new(config.kernel_root.clone())),
            config,
            context,
            registry: KernelRegistry::new(),
            memory: MemoryModel::new(),
            events: EventBus::new(),
            metrics,
            external: Mutex::new(()),
        };

        if runtime.is_supported() && runtime.config.compile_internal_kernels {
            runtime.compile_internal_kernels();
        }
        if let Some(ctx) = &runtime.context {
            info!(
                "runtime ready on '{}' with {} device(s)",
                ctx.platform().name,
                ctx.devices().len()
            );
        }
        Ok(runtime)
    }

    /// Replace the loader [`compile_file`](Runtime::compile_file) reads
    /// through.
    pub fn with_sources(mut self, sources: Arc<dyn SourceLoader>) -> Self {
        self.sources = sources;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_supported(&self) -> bool {
        self.context.is_some()
    }

    pub(crate) fn ctx(&self) -> Result<&ComputeContext> {
        self.context.as_ref().ok_or(Error::Unsupported)
    }

    pub fn context(&self) -> Option<&ComputeContext> {
        self.context.as_ref()
    }

    pub fn devices(&self) -> &[Device] {
        self.context.as_ref().map_or(&[], |ctx| ctx.devices())
    }

    pub fn set_active_device(&self, selector: DeviceSelector) -> Result<()> {
        self.ctx()?.set_active_device(selector);
        Ok(())
    }

    pub fn active_device(&self) -> Option<&Device> {
        self.context.as_ref().and_then(|ctx| ctx.active_device())
    }

    pub fn flush(&self) -> Result<()> {
        self.ctx()?.flush()
    }

    pub fn finish(&self) -> Result<()> {
        self.ctx()?.finish()
    }

    /// Take the caller-facing lock, blocking until it is free.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.external.lock()
    }

    pub fn try_acquire(&self) -> Option<MutexGuard<'_, ()>> {
        self.external.try_lock()
    }

    pub fn release(&self, guard: MutexGuard<'_, ()>) {
        drop(guard);
    }

    pub fn subscribe(&self) -> Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let Some(mut ctx) = self.context.take() else {
            return;
        };
        if let Err(err) = ctx.finish_all() {
            warn!("draining queues at shutdown failed: {err}");
        }

        let registry = self.registry.lock();
        let kernels = registry.borrow().ids();
        for id in kernels {
            self.destroy_kernel_locked(&ctx, &registry, id);
        }
        for id in self.memory.ids() {
            if self.contains_buffer(id) {
                if let Err(err) = self.delete_buffer_locked(&ctx, &registry, id) {
                    warn!("releasing {id} at shutdown failed: {err}");
                }
            }
        }
        drop(registry);

        ctx.release();
        info!("runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::{HostDeviceSpec, HostPlatformSpec};
    use crate::error::ErrorKind;

    fn no_platforms() -> Arc<HostDriver> {
        Arc::new(HostDriver::new("empty", vec![]))
    }

    #[test]
    fn test_unsupported_runtime() {
        let config = Config::builder()
            .host_fallback(false)
            .require_device(false)
            .build()
            .unwrap();
        let rt = Runtime::with_driver(config, no_platforms()).unwrap();
        assert!(!rt.is_supported());
        assert!(rt.devices().is_empty());
        assert!(matches!(rt.finish(), Err(Error::Unsupported)));
        assert!(matches!(
            rt.compile("k", "__kernel void k(void) {}", "k", ""),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn test_required_device_missing() {
        let config = Config::builder().host_fallback(false).build().unwrap();
        let err = Runtime::with_driver(config, no_platforms()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Enumeration);
    }

    #[test]
    fn test_internal_kernels_built() {
        let driver = Arc::new(HostDriver::new(
            "t",
            vec![HostPlatformSpec::new("Intel(R) OpenCL", "Intel")
                .with_device(HostDeviceSpec::cpu("cpu"))],
        ));
        let rt = Runtime::with_driver(Config::default(), driver).unwrap();
        assert_eq!(rt.kernel_count(), crate::kernel::INTERNAL_KERNELS.len());
        assert!(rt.kernel_id("vcl.fill_u32").is_some());
        assert!(rt.active_device().is_some());
    }

    #[test]
    fn test_external_lock() {
        let rt = Runtime::new(Config::default()).unwrap();
        let guard = rt.acquire();
        assert!(rt.try_acquire().is_none());
        rt.release(guard);
        assert!(rt.try_acquire().is_some());
    }
}
