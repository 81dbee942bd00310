//! Compute devices and how they are classified.

pub mod catalog;

pub use catalog::{
    build_catalog, classify_device, classify_platform, enumerate_platforms, score, DeviceCatalog,
    PlatformEntry,
};

use crate::driver::{DeviceHandle, DeviceType};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Every accepted device must support this extension.
pub const MANDATORY_EXTENSION: &str = "cl_khr_byte_addressable_store";

/// Who made a device, as far as build options and scoring care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    /// Portable Computing Language; identifies itself in the version string.
    Pocl,
    /// FreeOCL; identifies itself in the version string.
    FreeOcl,
    Unknown,
}

impl Vendor {
    /// Upper-case tag used in `-DVCL_VENDOR_<TAG>`.
    pub fn tag(self) -> &'static str {
        match self {
            Vendor::Nvidia => "NVIDIA",
            Vendor::Amd => "AMD",
            Vendor::Intel => "INTEL",
            Vendor::Apple => "APPLE",
            Vendor::Pocl => "POCL",
            Vendor::FreeOcl => "FREEOCL",
            Vendor::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Platform classification, from the platform name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
    /// The built-in host platform.
    Host,
}

impl PlatformVendor {
    /// Upper-case tag used in `-DVCL_PLATFORM_<TAG>`.
    pub fn tag(self) -> &'static str {
        match self {
            PlatformVendor::Nvidia => "NVIDIA",
            PlatformVendor::Amd => "AMD",
            PlatformVendor::Intel => "INTEL",
            PlatformVendor::Apple => "APPLE",
            PlatformVendor::Unknown => "UNKNOWN",
            PlatformVendor::Host => "HOST",
        }
    }
}

impl fmt::Display for PlatformVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Index of a native platform, or the host sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformIndex(pub usize);

impl PlatformIndex {
    /// The built-in host platform appended after the native ones.
    pub const HOST: PlatformIndex = PlatformIndex(usize::MAX);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for PlatformIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "host")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Cpu,
    Gpu,
}

/// Logical slot identifier such as `CPU0` or `GPU1`.
///
/// CPUs and GPUs are numbered separately; accelerators take GPU slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSlot {
    pub kind: SlotKind,
    pub index: u32,
}

impl DeviceSlot {
    pub fn cpu(index: u32) -> Self {
        Self {
            kind: SlotKind::Cpu,
            index,
        }
    }

    pub fn gpu(index: u32) -> Self {
        Self {
            kind: SlotKind::Gpu,
            index,
        }
    }
}

impl fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SlotKind::Cpu => write!(f, "CPU{}", self.index),
            SlotKind::Gpu => write!(f, "GPU{}", self.index),
        }
    }
}

impl FromStr for DeviceSlot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let (kind, digits) = if let Some(rest) = upper.strip_prefix("CPU") {
            (SlotKind::Cpu, rest)
        } else if let Some(rest) = upper.strip_prefix("GPU") {
            (SlotKind::Gpu, rest)
        } else {
            return Err(Error::invalid_argument(format!("unknown device slot '{s}'")));
        };
        let index = digits
            .parse()
            .map_err(|_| Error::invalid_argument(format!("unknown device slot '{s}'")))?;
        Ok(Self { kind, index })
    }
}

/// One accepted compute device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub handle: DeviceHandle,
    pub slot: DeviceSlot,
    pub device_type: DeviceType,
    pub vendor: Vendor,
    pub platform_vendor: PlatformVendor,
    pub name: String,
    pub vendor_name: String,
    pub version: String,
    pub language_version: String,
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
    /// Selection score; higher is faster.
    pub score: u64,
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        self.device_type == DeviceType::Cpu
    }

    pub fn is_gpu(&self) -> bool {
        self.device_type == DeviceType::Gpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' ({})", self.slot, self.name, self.vendor)
    }
}

/// Which device kinds the catalog accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRestriction {
    pub cpu: bool,
    pub gpu: bool,
    pub accelerator: bool,
}

impl Default for DeviceRestriction {
    fn default() -> Self {
        Self::all()
    }
}

impl DeviceRestriction {
    pub const fn all() -> Self {
        Self {
            cpu: true,
            gpu: true,
            accelerator: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            cpu: false,
            gpu: false,
            accelerator: false,
        }
    }

    /// Parse a comma-separated list of `CPU`, `GPU` and `ACCELERATOR`.
    /// An empty list accepts everything.
    pub fn parse(tokens: &str) -> Result<Self> {
        let mut restriction = Self::none();
        let mut any = false;
        for token in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            any = true;
            match token.to_ascii_uppercase().as_str() {
                "CPU" => restriction.cpu = true,
                "GPU" => restriction.gpu = true,
                "ACCELERATOR" => restriction.accelerator = true,
                _ => return Err(Error::config(format!("unknown device type '{token}'"))),
            }
        }
        Ok(if any { restriction } else { Self::all() })
    }

    pub fn allows(&self, device_type: DeviceType) -> bool {
        match device_type {
            DeviceType::Cpu => self.cpu,
            DeviceType::Gpu => self.gpu,
            DeviceType::Accelerator => self.accelerator,
        }
    }
}

impl FromStr for DeviceRestriction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// How [`set_active_device`](crate::context::ComputeContext::set_active_device)
/// picks a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceSelector {
    #[default]
    FastestGpu,
    FastestCpu,
    Slot(DeviceSlot),
}

impl FromStr for DeviceSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FASTEST_GPU" | "GPU" => Ok(DeviceSelector::FastestGpu),
            "FASTEST_CPU" | "CPU" => Ok(DeviceSelector::FastestCpu),
            _ => s.parse().map(DeviceSelector::Slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_round_trip() {
        let slot: DeviceSlot = "gpu1".parse().unwrap();
        assert_eq!(slot, DeviceSlot::gpu(1));
        assert_eq!(slot.to_string(), "GPU1");
        assert!("TPU0".parse::<DeviceSlot>().is_err());
        assert!("CPU".parse::<DeviceSlot>().is_err());
    }

    #[test]
    fn test_restriction_parse() {
        let r = DeviceRestriction::parse("CPU, accelerator").unwrap();
        assert!(r.cpu && r.accelerator && !r.gpu);
        assert_eq!(DeviceRestriction::parse("").unwrap(), DeviceRestriction::all());
        assert!(DeviceRestriction::parse("CPU,FPGA").is_err());
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(
            "fastest-cpu".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::FastestCpu
        );
        assert_eq!(
            "CPU1".parse::<DeviceSelector>().unwrap(),
            DeviceSelector::Slot(DeviceSlot::cpu(1))
        );
        assert!(PlatformIndex::HOST.is_host());
        assert_eq!(PlatformIndex(2).to_string(), "#2");
    }
}
