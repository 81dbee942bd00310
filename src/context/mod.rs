//! The execution context: one native context over the accepted devices of a
//! platform, one command queue per device, and the active device.

pub mod formats;

pub use formats::{ChannelLayout, ElementType, FormatTable};

use crate::device::{
    build_catalog, enumerate_platforms, Device, DeviceCatalog, DeviceRestriction, DeviceSelector,
    PlatformEntry, PlatformIndex, PlatformVendor, Vendor,
};
use crate::driver::host::HostDriver;
use crate::driver::{ContextHandle, DeviceHandle, Driver, ImageFormat, QueueHandle, ShareGroup};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs to [`ComputeContext::create`].
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    /// Platform tried first; later platforms are tried if it fails.
    pub platform: usize,
    /// Use every accepted device instead of only the fastest one.
    pub use_platform_devices: bool,
    pub restriction: DeviceRestriction,
    pub share_group: Option<ShareGroup>,
    pub host_fallback: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            platform: 0,
            use_platform_devices: true,
            restriction: DeviceRestriction::all(),
            share_group: None,
            host_fallback: true,
        }
    }
}

pub struct ComputeContext {
    driver: Arc<dyn Driver>,
    platform: PlatformEntry,
    handle: ContextHandle,
    catalog: DeviceCatalog,
    queues: HashMap<DeviceHandle, QueueHandle>,
    active: RwLock<Option<usize>>,
    share_group: Option<ShareGroup>,
    formats: FormatTable,
    released: bool,
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("driver", &self.driver.name())
            .field("platform", &self.platform)
            .field("devices", &self.catalog.len())
            .field("active", &*self.active.read())
            .finish_non_exhaustive()
    }
}

impl ComputeContext {
    /// Build a context, moving on to the next platform whenever one has no
    /// usable device or refuses the context.
    pub fn create(driver: Arc<dyn Driver>, options: &ContextOptions) -> Result<Self> {
        let platforms = enumerate_platforms(driver.as_ref(), options.host_fallback)?;
        let start = platforms
            .iter()
            .position(|p| p.index == PlatformIndex(options.platform))
            .unwrap_or_else(|| {
                warn!(
                    "platform #{} does not exist, starting from {}",
                    options.platform, platforms[0].index
                );
                0
            });

        let mut last_error = None;
        for entry in &platforms[start..] {
            match Self::on_platform(&driver, entry, options) {
                Ok(context) => return Ok(context),
                Err(err) => {
                    warn!("platform {} ('{}') unusable: {err}", entry.index, entry.name);
                    last_error = Some(err);
                }
            }
        }
        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no platform left to try".to_string());
        Err(Error::Enumeration(format!(
            "no platform yielded a usable context ({detail})"
        )))
    }

    fn on_platform(
        driver: &Arc<dyn Driver>,
        entry: &PlatformEntry,
        options: &ContextOptions,
    ) -> Result<Self> {
        let (driver, native) = if entry.index.is_host() {
            (Arc::new(HostDriver::system()) as Arc<dyn Driver>, 0)
        } else {
            (driver.clone(), entry.index.0)
        };

        let mut catalog = build_catalog(driver.as_ref(), native, entry.vendor, options.restriction)?;
        if catalog.is_empty() {
            return Err(Error::Enumeration(format!(
                "platform '{}' has no accepted device",
                entry.name
            )));
        }
        if !options.use_platform_devices {
            catalog = catalog.into_primary();
        }

        let mut share_group = options.share_group;
        if share_group.is_some() && !options.restriction.gpu {
            warn!("graphics sharing disabled: the device restriction excludes GPUs");
            share_group = None;
        }

        let devices: Vec<DeviceHandle> = catalog.devices().iter().map(|d| d.handle).collect();
        let handle = driver
            .create_context(native, &devices, share_group)
            .map_err(|source| Error::ContextCreation {
                platform: entry.name.clone(),
                source,
            })?;

        let mut queues = HashMap::new();
        for &device in &devices {
            match driver.create_queue(handle, device) {
                Ok(queue) => {
                    queues.insert(device, queue);
                }
                Err(source) => {
                    for queue in queues.into_values() {
                        driver.release_queue(queue);
                    }
                    driver.release_context(handle);
                    return Err(Error::ContextCreation {
                        platform: entry.name.clone(),
                        source,
                    });
                }
            }
        }

        let pocl = catalog.devices().iter().any(|d| d.vendor == Vendor::Pocl);
        let formats = if pocl {
            debug!("skipping image formats on POCL, images disabled");
            catalog.disable_images();
            FormatTable::empty()
        } else {
            let supported = driver.supported_image_formats(handle).unwrap_or_else(|err| {
                warn!("image format query failed: {err}");
                Vec::new()
            });
            let mixed_amd =
                entry.vendor == PlatformVendor::Amd && catalog.has_cpu() && catalog.has_gpu();
            FormatTable::build(&supported, mixed_amd)
        };

        info!(
            "context on platform {} ('{}') with {} device(s){}",
            entry.index,
            entry.name,
            catalog.len(),
            if share_group.is_some() { ", graphics sharing" } else { "" }
        );

        Ok(Self {
            driver,
            platform: entry.clone(),
            handle,
            catalog,
            queues,
            active: RwLock::new(None),
            share_group,
            formats,
            released: false,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn platform(&self) -> &PlatformEntry {
        &self.platform
    }

    pub fn platform_vendor(&self) -> PlatformVendor {
        self.platform.vendor
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn devices(&self) -> &[Device] {
        self.catalog.devices()
    }

    pub fn share_group(&self) -> Option<ShareGroup> {
        self.share_group
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    /// Native format for an abstract pixel format.
    pub fn image_format(&self, element: ElementType, layout: ChannelLayout) -> Result<ImageFormat> {
        self.formats.resolve(element, layout).ok_or_else(|| {
            Error::invalid_argument(format!(
                "no native image format for {element:?} x {layout:?}"
            ))
        })
    }

    pub fn queue_for(&self, device: DeviceHandle) -> Result<QueueHandle> {
        self.queues
            .get(&device)
            .copied()
            .ok_or(Error::InvalidHandle("device"))
    }

    /// Resolve `selector` and make that device active. Falls back to the
    /// first device when the requested one does not exist.
    pub fn set_active_device(&self, selector: DeviceSelector) {
        if self.catalog.is_empty() {
            warn!("no device available, active device unchanged");
            return;
        }
        let found = match selector {
            DeviceSelector::FastestGpu => self.catalog.fastest_gpu_index(),
            DeviceSelector::FastestCpu => self.catalog.fastest_cpu_index(),
            DeviceSelector::Slot(slot) => self.catalog.position(slot),
        };
        let index = found.unwrap_or_else(|| {
            warn!("{selector:?} not available, using the first device");
            0
        });
        *self.active.write() = Some(index);
        if let Some(device) = self.catalog.get(index) {
            info!("active device: {device}");
        }
    }

    pub fn active_index(&self) -> Option<usize> {
        *self.active.read()
    }

    pub fn active_device(&self) -> Option<&Device> {
        self.active_index().and_then(|i| self.catalog.get(i))
    }

    pub fn active_queue(&self) -> Result<QueueHandle> {
        let device = self
            .active_device()
            .ok_or_else(|| Error::invalid_argument("no active device"))?;
        self.queue_for(device.handle)
    }

    /// Submit everything queued on the active device.
    pub fn flush(&self) -> Result<()> {
        let queue = self.active_queue()?;
        self.driver
            .flush(queue)
            .map_err(|source| Error::native("flush", source))
    }

    /// Wait for the active device's queue to drain.
    pub fn finish(&self) -> Result<()> {
        let queue = self.active_queue()?;
        self.driver
            .finish(queue)
            .map_err(|source| Error::native("finish", source))
    }

    pub fn finish_all(&self) -> Result<()> {
        let mut first_error = None;
        for &queue in self.queues.values() {
            if let Err(source) = self.driver.finish(queue) {
                warn!("draining queue {} failed: {source}", queue.0);
                first_error.get_or_insert(Error::native("finish", source));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drain and release queues, then the context. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.finish_all();
        for (_, queue) in self.queues.drain() {
            self.driver.release_queue(queue);
        }
        self.driver.release_context(self.handle);
        debug!("context on platform {} released", self.platform.index);
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSlot;
    use crate::driver::host::{HostDeviceSpec, HostPlatformSpec};
    use crate::driver::{ChannelOrder, ChannelType};

    fn two_gpu_driver() -> Arc<HostDriver> {
        Arc::new(HostDriver::new(
            "t",
            vec![HostPlatformSpec::new("NVIDIA CUDA", "NVIDIA")
                .with_device(HostDeviceSpec::cpu("cpu"))
                .with_device(HostDeviceSpec::gpu("slow", "NVIDIA").with_compute(4, 1000))
                .with_device(HostDeviceSpec::gpu("fast", "NVIDIA").with_compute(40, 1000))],
        ))
    }

    #[test]
    fn test_active_device_selection() {
        let ctx = ComputeContext::create(two_gpu_driver(), &ContextOptions::default()).unwrap();
        assert!(ctx.active_device().is_none());
        ctx.set_active_device(DeviceSelector::FastestGpu);
        assert_eq!(ctx.active_device().unwrap().name, "fast");
        ctx.set_active_device(DeviceSelector::Slot(DeviceSlot::gpu(0)));
        assert_eq!(ctx.active_device().unwrap().name, "slow");
        ctx.set_active_device(DeviceSelector::Slot(DeviceSlot::gpu(7)));
        assert_eq!(ctx.active_index(), Some(0));
        assert!(ctx.finish().is_ok());
    }

    #[test]
    fn test_primary_device_only() {
        let options = ContextOptions {
            use_platform_devices: false,
            ..ContextOptions::default()
        };
        let ctx = ComputeContext::create(two_gpu_driver(), &options).unwrap();
        assert_eq!(ctx.devices().len(), 1);
        assert_eq!(ctx.devices()[0].name, "fast");
    }

    #[test]
    fn test_sharing_dropped_without_gpus() {
        let driver = two_gpu_driver();
        let group = driver.create_share_group();
        let options = ContextOptions {
            restriction: DeviceRestriction::parse("CPU").unwrap(),
            share_group: Some(group),
            ..ContextOptions::default()
        };
        let ctx = ComputeContext::create(driver, &options).unwrap();
        assert!(ctx.share_group().is_none());
        assert!(ctx.devices().iter().all(Device::is_cpu));
    }

    #[test]
    fn test_retry_next_platform() {
        let driver = Arc::new(HostDriver::new(
            "t",
            vec![
                HostPlatformSpec::new("Broken", "Acme")
                    .with_device(HostDeviceSpec::gpu("g", "Acme"))
                    .refusing_contexts(),
                HostPlatformSpec::new("Intel(R) OpenCL", "Intel")
                    .with_device(HostDeviceSpec::cpu("c")),
            ],
        ));
        let ctx = ComputeContext::create(driver, &ContextOptions::default()).unwrap();
        assert_eq!(ctx.platform().index, PlatformIndex(1));
        assert_eq!(ctx.platform_vendor(), PlatformVendor::Intel);
    }

    #[test]
    fn test_amd_mixed_context_format_override() {
        let driver = Arc::new(HostDriver::new(
            "t",
            vec![HostPlatformSpec::new("AMD Accelerated Parallel Processing", "AMD")
                .with_device(HostDeviceSpec::cpu("cpu"))
                .with_device(HostDeviceSpec::gpu("gpu", "Advanced Micro Devices, Inc."))],
        ));
        let ctx = ComputeContext::create(driver, &ContextOptions::default()).unwrap();
        let format = ctx.image_format(ElementType::Float, ChannelLayout::R).unwrap();
        assert_eq!(format, ImageFormat::new(ChannelOrder::Rgba, ChannelType::Float));
    }

    #[test]
    fn test_pocl_disables_images() {
        let driver = Arc::new(HostDriver::new(
            "t",
            vec![HostPlatformSpec::new("Portable Computing Language", "The pocl project")
                .with_device(HostDeviceSpec::cpu("pthread").with_version("OpenCL 1.2 pocl 1.8"))],
        ));
        let ctx = ComputeContext::create(driver, &ContextOptions::default()).unwrap();
        assert!(ctx.formats().is_empty());
        assert!(ctx.devices().iter().all(|d| !d.image_support));
    }
}
