//! Build options and per-device builds.

use super::binary;
use super::DeviceBuild;
use crate::config::Config;
use crate::context::ComputeContext;
use crate::device::{Device, PlatformVendor};
use crate::driver::{DeviceType, Driver};
use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Layout defines every kernel is built with, so host and device structs
/// agree.
pub const STRUCTURAL_OPTIONS: &str = "-DVCL_STRUCT_ALIGN=16 -DVCL_PACKED_STRUCTS=1";

/// Math flags, the include path and the configured defines.
pub fn global_options(config: &Config) -> String {
    join(&[
        config.math_options.clone(),
        format!("-I {}", config.kernel_root.display()),
        config.define_options(),
    ])
}

/// Defines describing one device.
pub fn device_options(device: &Device) -> String {
    let kind = match device.device_type {
        DeviceType::Cpu => "VCL_CPU",
        DeviceType::Gpu => "VCL_GPU",
        DeviceType::Accelerator => "VCL_ACCELERATOR",
    };
    format!(
        "-DVCL_VENDOR_{} -D{kind} -DVCL_PLATFORM_{} -DVCL_LOCAL_MEM_SIZE={} -DVCL_HAS_DOUBLE={}",
        device.vendor.tag(),
        device.platform_vendor.tag(),
        device.local_mem_size,
        u8::from(device.double_support),
    )
}

/// The full option string for one device, in build order: global,
/// structural, caller, device.
pub fn build_options(config: &Config, extra: &str, device: &Device) -> String {
    join(&[
        global_options(config),
        STRUCTURAL_OPTIONS.to_string(),
        extra.to_string(),
        device_options(device),
    ])
}

fn join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Apple's compiler caches programs by source text and ignores changed
/// headers; a timestamp line makes every build distinct.
pub fn prepare_source(platform: PlatformVendor, source: &str) -> String {
    if platform != PlatformVendor::Apple {
        return source.to_string();
    }
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("#define VCL_BUILD_TIMESTAMP {stamp}\n{source}")
}

/// Result of building one kernel for every context device.
pub(crate) struct BuiltKernel {
    pub(crate) builds: Vec<DeviceBuild>,
    pub(crate) arg_count: u32,
}

/// Build `entry` from `source` for every device of `ctx`.
///
/// The first failing device aborts the build: its log and options are
/// logged, everything built so far is released and the error returned.
pub(crate) fn build_all(
    ctx: &ComputeContext,
    config: &Config,
    identifier: &str,
    source: &str,
    entry: &str,
    extra: &str,
) -> Result<BuiltKernel> {
    let driver = ctx.driver();
    let source = prepare_source(ctx.platform_vendor(), source);
    let mut builds: Vec<DeviceBuild> = Vec::with_capacity(ctx.devices().len());

    for (index, device) in ctx.devices().iter().enumerate() {
        let options = build_options(config, extra, device);
        match build_one(driver.as_ref(), ctx, device, index, &source, entry, &options) {
            Ok(build) => builds.push(build),
            Err(err) => {
                if let Error::Compile { log, .. } = &err {
                    error!(
                        "kernel '{identifier}' ({entry}) failed on {device}: {err}\n  options: {options}\n{log}"
                    );
                } else {
                    error!("kernel '{identifier}' ({entry}) failed on {device}: {err}");
                }
                release_builds(driver.as_ref(), &builds);
                return Err(err);
            }
        }
    }

    let arg_count = builds.first().map_or(0, |b| b.arg_count);
    if let Some(other) = builds.iter().find(|b| b.arg_count != arg_count) {
        release_builds(driver.as_ref(), &builds);
        return Err(Error::invariant(format!(
            "kernel '{identifier}' declares {arg_count} arguments on one device and {} on device #{}",
            other.arg_count, other.device_index
        )));
    }

    if let Some(dir) = &config.binary_dir {
        for build in &builds {
            if let Err(err) = binary::save_binary(
                driver.as_ref(),
                build.program,
                dir,
                entry,
                build.device_index,
                ctx.platform_vendor(),
                config.disassembler.as_deref(),
            ) {
                warn!("saving binary of '{identifier}' for device #{} failed: {err}", build.device_index);
            }
        }
    }

    debug!(
        "kernel '{identifier}' built for {} device(s), {arg_count} argument(s)",
        builds.len()
    );
    Ok(BuiltKernel { builds, arg_count })
}

fn build_one(
    driver: &dyn Driver,
    ctx: &ComputeContext,
    device: &Device,
    device_index: usize,
    source: &str,
    entry: &str,
    options: &str,
) -> Result<DeviceBuild> {
    let compile_error = |status, log: String| Error::Compile {
        kernel: entry.to_string(),
        device: device.to_string(),
        status,
        log,
    };

    let program = driver
        .build_program(ctx.handle(), device.handle, source, options)
        .map_err(|failure| compile_error(failure.error, failure.log))?;

    let kernel = match driver.create_kernel(program, entry) {
        Ok(kernel) => kernel,
        Err(status) => {
            driver.release_program(program);
            let log = status.detail.clone();
            return Err(compile_error(status, log));
        }
    };

    let arg_count = match driver.kernel_arg_count(kernel) {
        Ok(n) => n,
        Err(status) => {
            driver.release_kernel(kernel);
            driver.release_program(program);
            return Err(Error::native("kernel_arg_count", status));
        }
    };

    let work_group_size = driver
        .kernel_work_group_size(kernel, device.handle)
        .unwrap_or_else(|status| {
            warn!("work-group size query for '{entry}' on {device} failed: {status}");
            device.max_work_group_size
        });

    Ok(DeviceBuild {
        device: device.handle,
        device_index,
        program,
        kernel,
        arg_count,
        work_group_size,
    })
}

pub(crate) fn release_builds(driver: &dyn Driver, builds: &[DeviceBuild]) {
    for build in builds {
        driver.release_kernel(build.kernel);
        driver.release_program(build.program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSlot, Vendor};
    use crate::driver::DeviceHandle;

    fn gpu() -> Device {
        Device {
            handle: DeviceHandle(1),
            slot: DeviceSlot::gpu(0),
            device_type: DeviceType::Gpu,
            vendor: Vendor::Nvidia,
            platform_vendor: PlatformVendor::Nvidia,
            name: "g".into(),
            vendor_name: "NVIDIA Corporation".into(),
            version: "OpenCL 3.0 CUDA".into(),
            language_version: "OpenCL C 1.2".into(),
            compute_units: 10,
            clock_mhz: 1000,
            global_mem_size: 1 << 30,
            local_mem_size: 49152,
            constant_mem_size: 65536,
            max_alloc_size: 1 << 28,
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 64],
            image_support: true,
            image2d_max: [16384, 16384],
            image3d_max: [2048, 2048, 2048],
            double_support: true,
            score: 0,
        }
    }

    #[test]
    fn test_option_order() {
        let config = Config::builder()
            .kernel_root("/k")
            .math_options("-cl-mad-enable")
            .define_value("N", 4)
            .build()
            .unwrap();
        let options = build_options(&config, "-DEXTRA", &gpu());
        assert_eq!(
            options,
            "-cl-mad-enable -I /k -DN=4 -DVCL_STRUCT_ALIGN=16 -DVCL_PACKED_STRUCTS=1 -DEXTRA \
             -DVCL_VENDOR_NVIDIA -DVCL_GPU -DVCL_PLATFORM_NVIDIA -DVCL_LOCAL_MEM_SIZE=49152 \
             -DVCL_HAS_DOUBLE=1"
        );
    }

    #[test]
    fn test_timestamp_only_on_apple() {
        assert_eq!(prepare_source(PlatformVendor::Nvidia, "x"), "x");
        let stamped = prepare_source(PlatformVendor::Apple, "x");
        assert!(stamped.starts_with("#define VCL_BUILD_TIMESTAMP "));
        assert!(stamped.ends_with("\nx"));
    }
}
