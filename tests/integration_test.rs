use std::sync::Arc;
use veda_cl::driver::host::{HostDeviceSpec, HostDriver, HostInvocation, HostPlatformSpec};
use veda_cl::driver::ImageType;
use veda_cl::kernel::binary::binary_file_name;
use veda_cl::memory::validate_region;
use veda_cl::prelude::*;

const ADD_ONE: &str = r#"
__kernel void add_one(__global uint* data, uint count) {
    size_t i = get_global_id(0);
    if (i < count) data[i] += 1;
}
"#;

const GUARDED: &str = r#"
#ifndef HAVE_TILES
#error HAVE_TILES must be defined
#endif
__kernel void add_one(__global uint* data, uint count) {}
"#;

fn add_one_body(inv: &mut HostInvocation<'_>) -> std::result::Result<(), String> {
    let count: u32 = inv.scalar(1)?;
    let mut data: Vec<u32> = inv.read(0)?;
    let n = (count as usize).min(data.len());
    for value in &mut data[..n] {
        *value += 1;
    }
    inv.write(0, 0, &data[..n])
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn intel_cpu() -> Arc<HostDriver> {
    init_logging();
    let driver = Arc::new(HostDriver::new(
        "test",
        vec![HostPlatformSpec::new("Intel(R) OpenCL", "Intel(R) Corporation")
            .with_device(HostDeviceSpec::cpu("Xeon"))],
    ));
    driver.register_kernel("add_one", add_one_body);
    driver
}

fn bare_config() -> Config {
    Config::builder().compile_internal_kernels(false).build().unwrap()
}

#[test]
fn test_buffer_round_trip() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();

    for size in [1usize, 4096, 1 << 20] {
        let pattern: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        let buffer = rt.create_buffer(MemFlags::default(), size, None).unwrap();
        rt.write_buffer(buffer, 0, &HostMemory::from_vec(pattern.clone())).unwrap();

        let out = HostMemory::zeroed(size);
        rt.read_buffer(buffer, 0, size, &out).unwrap();
        assert_eq!(out.to_vec(), pattern, "size {size}");
        rt.delete_buffer(buffer).unwrap();
    }
    assert_eq!(rt.buffer_count(), 0);
}

#[test]
fn test_compile_is_idempotent() {
    let driver = intel_cpu();
    let rt = Runtime::with_driver(bare_config(), driver.clone()).unwrap();

    let first = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    let builds = driver.stats().builds;
    let second = rt.compile("add", ADD_ONE, "add_one", "").unwrap();

    assert_eq!(first, second);
    assert_eq!(driver.stats().builds, builds);
    assert_eq!(rt.kernel_count(), 1);
    assert_eq!(rt.kernel_info(first).unwrap().arg_count, 2);
}

#[test]
fn test_compile_failure_registers_nothing() {
    let driver = intel_cpu();
    let rt = Runtime::with_driver(bare_config(), driver.clone()).unwrap();

    let err = rt.compile("guarded", GUARDED, "add_one", "").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert!(rt.kernel_id("guarded").is_none());
    assert_eq!(driver.stats().live_programs, 0);

    rt.compile("guarded", GUARDED, "add_one", "-DHAVE_TILES").unwrap();
    assert!(rt.kernel_id("guarded").is_some());
}

#[test]
fn test_global_defines_reach_every_build() {
    let config = Config::builder()
        .compile_internal_kernels(false)
        .define("HAVE_TILES")
        .build()
        .unwrap();
    let rt = Runtime::with_driver(config, intel_cpu()).unwrap();
    assert!(rt.compile("guarded", GUARDED, "add_one", "").is_ok());
}

#[test]
fn test_compile_file_through_loader() {
    let sources = MemorySourceLoader::new().with_file("math/add.cl", ADD_ONE);
    let rt = Runtime::with_driver(bare_config(), intel_cpu())
        .unwrap()
        .with_sources(Arc::new(sources));

    let id = rt.compile_file("add", "math/add.cl", "add_one", "").unwrap();
    assert_eq!(rt.kernel_id("add"), Some(id));
    assert!(rt.compile_file("missing", "nope.cl", "add_one", "").is_err());
}

#[test]
fn test_sub_buffer_bounds() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let parent = rt.create_buffer(MemFlags::default(), 256, None).unwrap();

    let err = rt.create_sub_buffer(parent, MemFlags::default(), 256, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bounds);
    assert!(rt.create_sub_buffer(parent, MemFlags::default(), 200, 100).is_err());

    let whole = rt.create_sub_buffer(parent, MemFlags::default(), 0, 256).unwrap();
    assert_eq!(rt.buffer_info(whole).unwrap().size, 256);
    assert_eq!(rt.buffer_info(parent).unwrap().sub_buffers, 1);
    assert_eq!(rt.buffer_info(whole).unwrap().parent, Some(parent));

    rt.delete_buffer(parent).unwrap();
    assert!(!rt.contains_buffer(whole));
    assert_eq!(rt.buffer_count(), 0);
}

#[test]
fn test_sub_buffer_shares_parent_storage() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let parent = rt.create_buffer(MemFlags::default(), 16, None).unwrap();
    rt.write_buffer_slice(parent, 0, &[1u32, 2, 3, 4]).unwrap();

    let tail = rt.create_sub_buffer(parent, MemFlags::default(), 8, 8).unwrap();
    let words: Vec<u32> = rt.read_buffer_vec(tail).unwrap();
    assert_eq!(words, vec![3, 4]);
}

#[test]
fn test_image_region_validation() {
    assert_eq!(
        validate_region("read", ImageType::Image1D, [64, 1, 1], [0, 0, 0], [0, 0, 0]).unwrap(),
        ([0, 0, 0], [64, 1, 1])
    );
    let err = validate_region("read", ImageType::Image1D, [64, 1, 1], [60, 0, 0], [8, 0, 0])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bounds);
    assert!(err.to_string().contains('x'));

    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let image = rt
        .create_image_1d(MemFlags::default(), ChannelLayout::R, ElementType::Float, 16, None)
        .unwrap();
    let pixels = HostMemory::from_slice(&[0.25f32; 16]);
    rt.write_image(image, [0; 3], [0; 3], &pixels).unwrap();
    assert!(rt.write_image(image, [8, 0, 0], [16, 0, 0], &pixels).is_err());

    let out = HostMemory::zeroed(16 * 4);
    rt.read_image(image, [0; 3], [0; 3], &out).unwrap();
    assert_eq!(out.to_typed::<f32>(), vec![0.25; 16]);
}

#[test]
fn test_missing_argument_submits_nothing() {
    let driver = intel_cpu();
    let rt = Runtime::with_driver(bare_config(), driver.clone()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 64, None).unwrap();

    rt.bind_buffer(kernel, 0, buffer).unwrap();
    rt.compute_execution_grid_1d(kernel, 16).unwrap();
    let err = rt.dispatch(kernel).unwrap_err();

    assert!(matches!(err, Error::MissingArgument { index: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::ArgumentBinding);
    assert_eq!(driver.stats().kernel_submissions, 0);
}

#[test]
fn test_binding_out_of_range() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    let err = rt.bind_scalar(kernel, 2, 5u32).unwrap_err();
    assert!(matches!(err, Error::ArgumentBinding { index: 2, size: 4, .. }));
}

#[test]
fn test_scalar_rebind_clears_buffer_association() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 64, None).unwrap();

    rt.bind_buffer(kernel, 0, buffer).unwrap();
    assert_eq!(rt.buffer_info(buffer).unwrap().bound_kernels, 1);
    assert_eq!(rt.kernel_info(kernel).unwrap().bound_buffers[0], Some(buffer));

    rt.bind_scalar(kernel, 0, 7u64).unwrap();
    assert_eq!(rt.buffer_info(buffer).unwrap().bound_kernels, 0);
    let info = rt.kernel_info(kernel).unwrap();
    assert_eq!(info.bound_buffers[0], None);
    assert!(info.args_passed[0]);
}

#[test]
fn test_delete_kernel_clears_associations() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    let other = rt.compile("add2", ADD_ONE, "add_one", "").unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 64, None).unwrap();

    rt.bind_buffer(kernel, 0, buffer).unwrap();
    rt.bind_buffer(other, 0, buffer).unwrap();
    assert_eq!(rt.buffer_info(buffer).unwrap().bound_kernels, 2);

    rt.delete_kernel(kernel).unwrap();
    assert_eq!(rt.buffer_info(buffer).unwrap().bound_kernels, 1);
    assert!(rt.kernel_info(kernel).is_err());

    rt.delete_kernel(other).unwrap();
    assert_eq!(rt.buffer_info(buffer).unwrap().bound_kernels, 0);
    rt.delete_buffer(buffer).unwrap();
}

#[test]
fn test_panicking_kernel_leaves_queue_usable() {
    let driver = intel_cpu();
    driver.register_kernel("explode", |_inv| panic!("kernel body blew up"));
    let rt = Runtime::with_driver(bare_config(), driver).unwrap();
    let kernel = rt
        .compile("explode", "__kernel void explode(__global uint* data) {}", "explode", "")
        .unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 16, None).unwrap();
    rt.bind_buffer(kernel, 0, buffer).unwrap();
    rt.compute_execution_grid_1d(kernel, 4).unwrap();

    let failed = rt.dispatch(kernel).and_then(|()| rt.finish());
    let err = failed.unwrap_err();
    assert!(err.to_string().contains("kernel panicked"), "{err}");

    rt.write_buffer_slice(buffer, 0, &[1u32, 2, 3, 4]).unwrap();
    let words: Vec<u32> = rt.read_buffer_vec(buffer).unwrap();
    assert_eq!(words, vec![1, 2, 3, 4]);
    assert!(rt.finish().is_ok());
}

#[test]
fn test_oversized_grid_rejected() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    let err = rt.compute_execution_grid_1d(kernel, usize::MAX - 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Bounds);
    assert!(rt.kernel_info(kernel).unwrap().grid.is_none());
}

#[test]
fn test_read_back_then_delete_after_use() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();

    let host = HostMemory::from_slice(&[1u32, 2, 3, 4]);
    let flags = MemFlags::default().with_read_back().with_delete_after_use();
    let buffer = rt.create_buffer(flags, 16, Some(host.clone())).unwrap();

    rt.bind_buffer(kernel, 0, buffer).unwrap();
    rt.bind_scalar(kernel, 1, 4u32).unwrap();
    rt.compute_execution_grid_1d(kernel, 4).unwrap();
    assert!(rt.contains_buffer(buffer));

    rt.dispatch(kernel).unwrap();

    assert!(!rt.contains_buffer(buffer));
    assert_eq!(host.to_typed::<u32>(), vec![2, 3, 4, 5]);
    let info = rt.kernel_info(kernel).unwrap();
    assert_eq!(info.bound_buffers[0], None);
    assert!(!info.args_passed[0]);
}

#[test]
fn test_copy_on_use_refreshes_device_copy() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();

    let host = HostMemory::from_slice(&[10u32, 20]);
    let flags = MemFlags::default().with_copy_on_use().with_read_back();
    let buffer = rt.create_buffer(flags, 8, Some(host.clone())).unwrap();
    rt.bind_buffer(kernel, 0, buffer).unwrap();
    rt.bind_scalar(kernel, 1, 2u32).unwrap();
    rt.compute_execution_grid_1d(kernel, 2).unwrap();

    rt.dispatch(kernel).unwrap();
    assert_eq!(host.to_typed::<u32>(), vec![11, 21]);

    let refreshed: Vec<u8> = [100u32, 200].iter().flat_map(|w| w.to_ne_bytes()).collect();
    assert!(host.fill_from(0, &refreshed));
    rt.dispatch(kernel).unwrap();
    assert_eq!(host.to_typed::<u32>(), vec![101, 201]);
    assert_eq!(rt.kernel_info(kernel).unwrap().dispatch_count, 2);
    assert_eq!(rt.kernel_info(kernel).unwrap().cached_descriptors, 1);
}

#[test]
fn test_reload_emits_event() {
    let rt = Runtime::with_driver(Config::default(), intel_cpu()).unwrap();
    let events = rt.subscribe();
    let user = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    rt.use_kernel(user).unwrap();

    assert!(rt.reload_all().unwrap());

    match events.try_recv().unwrap() {
        RuntimeEvent::KernelsReloaded { success, .. } => assert!(success),
    }
    assert!(rt.kernel_info(user).is_err());
    assert!(rt.current_kernel().is_none());
    assert_eq!(rt.kernel_count(), veda_cl::kernel::INTERNAL_KERNELS.len());
}

#[test]
fn test_fastest_gpu_follows_score() {
    let driver = Arc::new(HostDriver::new(
        "test",
        vec![HostPlatformSpec::new("NVIDIA CUDA", "NVIDIA Corporation")
            .with_device(
                HostDeviceSpec::gpu("wide", "NVIDIA Corporation")
                    .with_compute(10, 1000)
                    .with_max_work_group_size(1024),
            )
            .with_device(
                HostDeviceSpec::gpu("fast-clock", "NVIDIA Corporation")
                    .with_compute(8, 2000)
                    .with_max_work_group_size(1024),
            )],
    ));
    let rt = Runtime::with_driver(bare_config(), driver).unwrap();

    let active = rt.active_device().unwrap();
    assert_eq!(active.name, "fast-clock");
    assert_eq!(active.score, 8 * 2000 * 32);
    assert_eq!(rt.devices()[0].score, 10 * 1000 * 32);
}

#[test]
fn test_refused_platform_falls_through() {
    let driver = Arc::new(HostDriver::new(
        "test",
        vec![
            HostPlatformSpec::new("AMD Accelerated Parallel Processing", "AMD")
                .with_device(HostDeviceSpec::gpu("gfx", "Advanced Micro Devices, Inc."))
                .refusing_contexts(),
            HostPlatformSpec::new("Intel(R) OpenCL", "Intel(R) Corporation")
                .with_device(HostDeviceSpec::cpu("Xeon")),
        ],
    ));
    let rt = Runtime::with_driver(Config::default(), driver).unwrap();
    let ctx = rt.context().unwrap();
    assert_eq!(ctx.platform().name, "Intel(R) OpenCL");
    assert!(rt.active_device().unwrap().is_cpu());
}

#[test]
fn test_pocl_runtime_has_no_images() {
    let driver = Arc::new(HostDriver::new(
        "test",
        vec![HostPlatformSpec::new("Portable Computing Language", "The pocl project")
            .with_device(HostDeviceSpec::cpu("pthread").with_version("OpenCL 1.2 pocl 1.8"))],
    ));
    let rt = Runtime::with_driver(Config::default(), driver).unwrap();
    assert!(rt
        .create_image_2d(MemFlags::default(), ChannelLayout::Rgba, ElementType::Unorm8, [4, 4], None)
        .is_err());
}

#[test]
fn test_automatic_graphics_sharing() {
    let driver = Arc::new(HostDriver::new(
        "test",
        vec![HostPlatformSpec::new("NVIDIA CUDA", "NVIDIA Corporation")
            .with_device(HostDeviceSpec::gpu("gpu", "NVIDIA Corporation"))],
    ));
    let group = driver.create_share_group();
    let config = Config::builder().graphics_sharing(group).build().unwrap();
    let rt = Runtime::with_driver(config, driver.clone()).unwrap();

    let object = driver.new_graphics_buffer(group, 64).unwrap();
    let shared = rt.create_graphics_buffer(MemFlags::default(), object).unwrap();
    rt.fill_u32(shared, 9, 16).unwrap();
    rt.finish().unwrap();

    let stats = driver.stats();
    assert_eq!(stats.acquires, 1);
    assert_eq!(stats.releases, 1);
    assert!(!driver.is_acquired(object));
    let contents = driver.graphics_contents(object).unwrap();
    let words: Vec<u32> = contents
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(words, vec![9u32; 16]);
    let fill = rt.kernel_id("vcl.fill_u32").unwrap();
    assert!(rt.kernel_info(fill).unwrap().has_graphics_args);
}

#[test]
fn test_manual_graphics_sharing() {
    let driver = Arc::new(HostDriver::new(
        "test",
        vec![HostPlatformSpec::new("NVIDIA CUDA", "NVIDIA Corporation")
            .with_device(HostDeviceSpec::gpu("gpu", "NVIDIA Corporation"))],
    ));
    let group = driver.create_share_group();
    let config = Config::builder()
        .graphics_sharing(group)
        .compile_internal_kernels(false)
        .build()
        .unwrap();
    let rt = Runtime::with_driver(config, driver.clone()).unwrap();

    let object = driver.new_graphics_buffer(group, 32).unwrap();
    let shared = rt.create_graphics_buffer(MemFlags::default(), object).unwrap();
    let plain = rt.create_buffer(MemFlags::default(), 32, None).unwrap();
    assert!(rt.acquire_graphics(&[shared]).is_err());
    assert!(rt.set_manual_graphics_sharing(plain, true).is_err());

    rt.set_manual_graphics_sharing(shared, true).unwrap();
    rt.acquire_graphics(&[shared]).unwrap();
    rt.finish().unwrap();
    assert!(driver.is_acquired(object));
    rt.release_graphics(&[shared]).unwrap();
    rt.finish().unwrap();
    assert!(!driver.is_acquired(object));
}

#[test]
fn test_graphics_requires_share_group() {
    let driver = intel_cpu();
    let group = driver.create_share_group();
    let object = driver.new_graphics_buffer(group, 16).unwrap();
    let rt = Runtime::with_driver(bare_config(), driver).unwrap();
    assert!(rt.create_graphics_buffer(MemFlags::default(), object).is_err());
}

#[test]
fn test_binaries_saved() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::builder()
        .compile_internal_kernels(false)
        .binary_dir(dir.path())
        .build()
        .unwrap();
    let rt = Runtime::with_driver(config, intel_cpu()).unwrap();
    rt.compile("add", ADD_ONE, "add_one", "").unwrap();

    let platform = rt.context().unwrap().platform_vendor();
    let path = dir.path().join(binary_file_name("add_one", 0, platform));
    assert!(path.exists(), "{} missing", path.display());
    assert!(std::fs::metadata(&path).unwrap().len() > 0);
}

#[test]
fn test_internal_kernels() {
    let rt = Runtime::with_driver(Config::default(), intel_cpu()).unwrap();

    let a = rt.create_buffer(MemFlags::default(), 40, None).unwrap();
    let b = rt.create_buffer(MemFlags::default(), 40, None).unwrap();
    rt.fill_u32(a, 0x0101_0101, 10).unwrap();
    rt.copy_bytes(a, b, 40).unwrap();
    let words: Vec<u32> = rt.read_buffer_vec(b).unwrap();
    assert_eq!(words, vec![0x0101_0101; 10]);

    let floats = rt.create_buffer(MemFlags::default(), 12, None).unwrap();
    rt.write_buffer_slice(floats, 0, &[2.0f32, 4.0, 8.0]).unwrap();
    rt.scale_f32(floats, 0.25, 3).unwrap();
    assert_eq!(rt.read_buffer_vec::<f32>(floats).unwrap(), vec![0.5, 1.0, 2.0]);
}

#[test]
fn test_map_buffer() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 16, None).unwrap();
    rt.write_buffer_slice(buffer, 0, &[5u32, 6, 7, 8]).unwrap();

    let mapped = rt.map_buffer(buffer, 4, 8, false, true).unwrap();
    assert_eq!(mapped.len(), 8);
    assert_eq!(mapped.data().to_typed::<u32>(), vec![6, 7]);
    rt.unmap(mapped).unwrap();

    assert!(rt.map_buffer(buffer, 12, 8, false, true).is_err());
}

#[test]
fn test_stale_handles_rejected() {
    let rt = Runtime::with_driver(bare_config(), intel_cpu()).unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 8, None).unwrap();
    rt.delete_buffer(buffer).unwrap();
    let reused = rt.create_buffer(MemFlags::default(), 8, None).unwrap();

    assert_ne!(buffer, reused);
    assert!(rt.buffer_info(buffer).is_err());
    assert!(rt.delete_buffer(buffer).is_err());

    let kernel = rt.compile("add", ADD_ONE, "add_one", "").unwrap();
    rt.delete_kernel(kernel).unwrap();
    assert!(rt.bind_buffer(kernel, 0, reused).is_err());
}

#[test]
fn test_shutdown_releases_native_objects() {
    let driver = intel_cpu();
    {
        let rt = Runtime::with_driver(Config::default(), driver.clone()).unwrap();
        let parent = rt.create_buffer(MemFlags::default(), 64, None).unwrap();
        rt.create_sub_buffer(parent, MemFlags::default(), 0, 32).unwrap();
        rt.fill_u32(parent, 1, 16).unwrap();
        assert!(driver.stats().live_kernels > 0);
    }
    let stats = driver.stats();
    assert_eq!(stats.live_mem_objects, 0);
    assert_eq!(stats.live_kernels, 0);
    assert_eq!(stats.live_programs, 0);
    assert_eq!(stats.live_queues, 0);
}

#[cfg(feature = "telemetry")]
#[test]
fn test_metrics_track_dispatches() {
    let rt = Runtime::with_driver(Config::default(), intel_cpu()).unwrap();
    let buffer = rt.create_buffer(MemFlags::default(), 16, None).unwrap();
    rt.fill_u32(buffer, 3, 4).unwrap();
    rt.fill_u32(buffer, 4, 4).unwrap();

    let snapshot = rt.metrics();
    assert_eq!(snapshot.dispatches, 2);
    assert_eq!(snapshot.dispatch_failures, 0);
    assert!(snapshot.builds >= 3);
}
