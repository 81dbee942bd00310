//! Platform enumeration and the per-platform device catalog.

use super::{
    Device, DeviceRestriction, DeviceSlot, PlatformIndex, PlatformVendor, Vendor,
    MANDATORY_EXTENSION,
};
use crate::driver::{DeviceType, Driver, NativeDeviceInfo};
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

/// One platform the runtime may build a context on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEntry {
    pub vendor: PlatformVendor,
    pub index: PlatformIndex,
    pub name: String,
}

/// Classify a platform by its name.
pub fn classify_platform(name: &str) -> PlatformVendor {
    let name = name.to_lowercase();
    if name.contains("nvidia") {
        PlatformVendor::Nvidia
    } else if name.contains("amd") {
        PlatformVendor::Amd
    } else if name.contains("intel") {
        PlatformVendor::Intel
    } else if name.contains("apple") {
        PlatformVendor::Apple
    } else {
        PlatformVendor::Unknown
    }
}

/// Classify a device by its vendor string, or by its version string for the
/// implementations that only identify themselves there.
pub fn classify_device(vendor: &str, version: &str) -> Vendor {
    let version = version.to_lowercase();
    if version.contains("pocl") {
        return Vendor::Pocl;
    }
    if version.contains("freeocl") {
        return Vendor::FreeOcl;
    }
    let vendor = vendor.to_lowercase();
    if vendor.contains("nvidia") {
        Vendor::Nvidia
    } else if vendor.contains("amd") || vendor.contains("advanced micro devices") {
        Vendor::Amd
    } else if vendor.contains("intel") {
        Vendor::Intel
    } else if vendor.contains("apple") {
        Vendor::Apple
    } else {
        Vendor::Unknown
    }
}

/// Selection score: compute units x clock x a vendor multiplier.
pub fn score(
    device_type: DeviceType,
    vendor: Vendor,
    compute_units: u32,
    clock_mhz: u32,
    max_work_group_size: usize,
) -> u64 {
    let multiplier = match (device_type, vendor) {
        (DeviceType::Cpu, _) => 1,
        (_, Vendor::Nvidia) if max_work_group_size >= 1024 => 32,
        (_, Vendor::Nvidia) => 8,
        (_, Vendor::Amd) => 16,
        _ => 1,
    };
    u64::from(compute_units) * u64::from(clock_mhz) * multiplier
}

/// List the native platforms, plus the host platform when `host_fallback`
/// is set and the `host-fallback` feature is compiled in.
pub fn enumerate_platforms(driver: &dyn Driver, host_fallback: bool) -> Result<Vec<PlatformEntry>> {
    let native = match driver.platforms() {
        Ok(platforms) => platforms,
        Err(err) => {
            warn!("platform enumeration on '{}' failed: {err}", driver.name());
            Vec::new()
        }
    };

    let mut entries: Vec<PlatformEntry> = native
        .into_iter()
        .enumerate()
        .map(|(i, p)| PlatformEntry {
            vendor: classify_platform(&p.name),
            index: PlatformIndex(i),
            name: p.name,
        })
        .collect();

    if cfg!(feature = "host-fallback") && host_fallback {
        entries.push(PlatformEntry {
            vendor: PlatformVendor::Host,
            index: PlatformIndex::HOST,
            name: "host".to_string(),
        });
    }

    if entries.is_empty() {
        return Err(Error::Enumeration("no compute platform found".to_string()));
    }
    for entry in &entries {
        debug!("platform {}: '{}' ({})", entry.index, entry.name, entry.vendor);
    }
    Ok(entries)
}

/// The accepted devices of one platform.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
    fastest_cpu: Option<usize>,
    fastest_gpu: Option<usize>,
    rejected: usize,
}

impl DeviceCatalog {
    fn push(&mut self, device: Device) {
        let index = self.devices.len();
        let slot = match device.device_type {
            DeviceType::Cpu => Some(&mut self.fastest_cpu),
            DeviceType::Gpu => Some(&mut self.fastest_gpu),
            DeviceType::Accelerator => None,
        };
        if let Some(slot) = slot {
            let faster = match *slot {
                Some(best) => device.score > self.devices[best].score,
                None => true,
            };
            if faster {
                *slot = Some(index);
            }
        }
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices enumerated but turned away for lacking the mandatory extension.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn position(&self, slot: DeviceSlot) -> Option<usize> {
        self.devices.iter().position(|d| d.slot == slot)
    }

    pub fn fastest_cpu(&self) -> Option<&Device> {
        self.fastest_cpu.map(|i| &self.devices[i])
    }

    pub fn fastest_gpu(&self) -> Option<&Device> {
        self.fastest_gpu.map(|i| &self.devices[i])
    }

    pub fn fastest_cpu_index(&self) -> Option<usize> {
        self.fastest_cpu
    }

    pub fn fastest_gpu_index(&self) -> Option<usize> {
        self.fastest_gpu
    }

    pub fn has_cpu(&self) -> bool {
        self.devices.iter().any(Device::is_cpu)
    }

    pub fn has_gpu(&self) -> bool {
        self.devices.iter().any(Device::is_gpu)
    }

    /// Keep only the fastest GPU, or the fastest CPU when there is no GPU.
    pub fn into_primary(self) -> DeviceCatalog {
        let keep = self.fastest_gpu.or(self.fastest_cpu);
        let mut primary = DeviceCatalog {
            rejected: self.rejected,
            ..DeviceCatalog::default()
        };
        if let Some(index) = keep {
            if let Some(device) = self.devices.into_iter().nth(index) {
                primary.push(device);
            }
        }
        primary
    }

    /// Turn image support off on every device.
    pub(crate) fn disable_images(&mut self) {
        for device in &mut self.devices {
            device.image_support = false;
        }
    }
}

fn to_device(
    info: &NativeDeviceInfo,
    slot: DeviceSlot,
    vendor: Vendor,
    platform_vendor: PlatformVendor,
) -> Device {
    let mut compute_units = info.compute_units;
    if compute_units == 0 && matches!(vendor, Vendor::Pocl | Vendor::FreeOcl) {
        compute_units = num_cpus::get_physical() as u32;
        debug!(
            "'{}' reports no compute units, using {compute_units} physical cores",
            info.name
        );
    }
    Device {
        handle: info.handle,
        slot,
        device_type: info.device_type,
        vendor,
        platform_vendor,
        name: info.name.clone(),
        vendor_name: info.vendor.clone(),
        version: info.version.clone(),
        language_version: info.language_version.clone(),
        compute_units,
        clock_mhz: info.clock_mhz,
        global_mem_size: info.global_mem_size,
        local_mem_size: info.local_mem_size,
        constant_mem_size: info.constant_mem_size,
        max_alloc_size: info.max_alloc_size,
        max_work_group_size: info.max_work_group_size,
        max_work_item_sizes: info.max_work_item_sizes,
        image_support: info.image_support,
        image2d_max: info.image2d_max,
        image3d_max: info.image3d_max,
        double_support: info.double_support,
        score: score(
            info.device_type,
            vendor,
            compute_units,
            info.clock_mhz,
            info.max_work_group_size,
        ),
    }
}

/// Enumerate and classify the devices of native platform `platform`.
///
/// An empty catalog is not an error; the caller moves on to another platform.
pub fn build_catalog(
    driver: &dyn Driver,
    platform: usize,
    platform_vendor: PlatformVendor,
    restriction: DeviceRestriction,
) -> Result<DeviceCatalog> {
    let infos = driver.devices(platform).map_err(|source| {
        warn!("device enumeration on platform #{platform} failed: {source}");
        Error::Enumeration(format!("platform #{platform}: {source}"))
    })?;

    let mut catalog = DeviceCatalog::default();
    let mut cpus = 0u32;
    let mut gpus = 0u32;
    for info in infos.iter().filter(|i| restriction.allows(i.device_type)) {
        if !info.has_extension(MANDATORY_EXTENSION) {
            warn!("'{}' lacks {MANDATORY_EXTENSION}, skipping it", info.name);
            catalog.rejected += 1;
            continue;
        }
        let slot = match info.device_type {
            DeviceType::Cpu => {
                cpus += 1;
                DeviceSlot::cpu(cpus - 1)
            }
            DeviceType::Gpu | DeviceType::Accelerator => {
                gpus += 1;
                DeviceSlot::gpu(gpus - 1)
            }
        };
        let vendor = classify_device(&info.vendor, &info.version);
        let device = to_device(info, slot, vendor, platform_vendor);
        debug!(
            "{device}: {} units @ {} MHz, score {}",
            device.compute_units, device.clock_mhz, device.score
        );
        catalog.push(device);
    }

    if let Some(gpu) = catalog.fastest_gpu() {
        info!("fastest GPU on platform #{platform}: {gpu}");
    }
    if let Some(cpu) = catalog.fastest_cpu() {
        info!("fastest CPU on platform #{platform}: {cpu}");
    }
    Ok(catalog)
}
