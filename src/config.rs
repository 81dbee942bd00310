use crate::device::{DeviceRestriction, DeviceSelector};
use crate::error::{Error, Result};
use std::path::PathBuf;

/// Environment variable holding a device restriction, e.g. `CPU,GPU`.
pub const ENV_DEVICES: &str = "VCL_DEVICES";
/// Environment variable holding the platform index tried first.
pub const ENV_PLATFORM: &str = "VCL_PLATFORM";
/// Environment variable holding the kernel source root.
pub const ENV_KERNEL_ROOT: &str = "VCL_KERNEL_ROOT";
/// Environment variable holding a directory to write program binaries to.
pub const ENV_SAVE_BINARIES: &str = "VCL_SAVE_BINARIES";

/// Math relaxation flags passed to every build.
pub const DEFAULT_MATH_OPTIONS: &str =
    "-cl-mad-enable -cl-no-signed-zeros -cl-fast-relaxed-math";

#[derive(Debug, Clone)]
pub struct Config {
    /// Platform tried first when building the context.
    pub platform_index: usize,
    /// Put every accepted device of the platform in the context. When false,
    /// only the fastest GPU (or CPU) is used.
    pub use_platform_devices: bool,
    pub device_restriction: DeviceRestriction,
    pub active_device: DeviceSelector,
    /// Bind the context to a graphics share-group.
    pub graphics_sharing: Option<crate::driver::ShareGroup>,
    /// Fall back to the built-in host platform when no native one works.
    pub host_fallback: bool,
    /// Fail construction when no device is usable instead of building an
    /// unsupported runtime.
    pub require_device: bool,

    pub kernel_root: PathBuf,
    pub math_options: String,
    /// `NAME` or `NAME=VALUE` pairs turned into `-D` options for every build.
    pub defines: Vec<(String, Option<String>)>,
    pub compile_internal_kernels: bool,

    /// Write each program binary to this directory after a build.
    pub binary_dir: Option<PathBuf>,
    /// Tool run on AMD binaries after they are written.
    pub disassembler: Option<PathBuf>,

    #[cfg(feature = "telemetry")]
    pub enable_telemetry: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            platform_index: 0,
            use_platform_devices: true,
            device_restriction: DeviceRestriction::all(),
            active_device: DeviceSelector::FastestGpu,
            graphics_sharing: None,
            host_fallback: true,
            require_device: true,

            kernel_root: PathBuf::from("kernels"),
            math_options: DEFAULT_MATH_OPTIONS.to_string(),
            defines: Vec::new(),
            compile_internal_kernels: true,

            binary_dir: None,
            disassembler: None,

            #[cfg(feature = "telemetry")]
            enable_telemetry: true,
        }
    }
}

fn valid_define_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Defaults overridden by the `VCL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        if let Some(devices) = lookup(ENV_DEVICES) {
            config.device_restriction = DeviceRestriction::parse(&devices)?;
        }
        if let Some(platform) = lookup(ENV_PLATFORM) {
            config.platform_index = platform.trim().parse().map_err(|_| {
                Error::config(format!("{ENV_PLATFORM} must be an index, got '{platform}'"))
            })?;
        }
        if let Some(root) = lookup(ENV_KERNEL_ROOT) {
            config.kernel_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup(ENV_SAVE_BINARIES).filter(|d| !d.is_empty()) {
            config.binary_dir = Some(PathBuf::from(dir));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.device_restriction;
        if !(r.cpu || r.gpu || r.accelerator) {
            return Err(Error::config("device restriction excludes every device type"));
        }
        for (name, _) in &self.defines {
            if !valid_define_name(name) {
                return Err(Error::config(format!("invalid define name '{name}'")));
            }
        }
        if let Some(dir) = &self.binary_dir {
            if dir.as_os_str().is_empty() {
                return Err(Error::config("binary_dir must not be empty"));
            }
        }
        Ok(())
    }

    /// The configured defines as `-D` options.
    pub fn define_options(&self) -> String {
        self.defines
            .iter()
            .map(|(name, value)| match value {
                Some(value) => format!("-D{name}={value}"),
                None => format!("-D{name}"),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn save_binaries(&self) -> bool {
        self.binary_dir.is_some()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn platform_index(mut self, index: usize) -> Self {
        self.config.platform_index = index;
        self
    }

    pub fn use_platform_devices(mut self, enable: bool) -> Self {
        self.config.use_platform_devices = enable;
        self
    }

    pub fn device_restriction(mut self, restriction: DeviceRestriction) -> Self {
        self.config.device_restriction = restriction;
        self
    }

    pub fn active_device(mut self, selector: DeviceSelector) -> Self {
        self.config.active_device = selector;
        self
    }

    pub fn graphics_sharing(mut self, group: crate::driver::ShareGroup) -> Self {
        self.config.graphics_sharing = Some(group);
        self
    }

    pub fn host_fallback(mut self, enable: bool) -> Self {
        self.config.host_fallback = enable;
        self
    }

    pub fn require_device(mut self, require: bool) -> Self {
        self.config.require_device = require;
        self
    }

    pub fn kernel_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config.kernel_root = root.into();
        self
    }

    pub fn math_options<S: Into<String>>(mut self, options: S) -> Self {
        self.config.math_options = options.into();
        self
    }

    pub fn define<S: Into<String>>(mut self, name: S) -> Self {
        self.config.defines.push((name.into(), None));
        self
    }

    pub fn define_value<S: Into<String>, V: ToString>(mut self, name: S, value: V) -> Self {
        self.config
            .defines
            .push((name.into(), Some(value.to_string())));
        self
    }

    pub fn compile_internal_kernels(mut self, enable: bool) -> Self {
        self.config.compile_internal_kernels = enable;
        self
    }

    pub fn binary_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.binary_dir = Some(dir.into());
        self
    }

    pub fn disassembler<P: Into<PathBuf>>(mut self, tool: P) -> Self {
        self.config.disassembler = Some(tool.into());
        self
    }

    #[cfg(feature = "telemetry")]
    pub fn enable_telemetry(mut self, enable: bool) -> Self {
        self.config.enable_telemetry = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builder_validates() {
        assert!(Config::builder()
            .device_restriction(DeviceRestriction::none())
            .build()
            .is_err());
        assert!(Config::builder().define("9LIVES").build().is_err());

        let config = Config::builder()
            .define("USE_FAST_PATH")
            .define_value("TILE", 16)
            .build()
            .unwrap();
        assert_eq!(config.define_options(), "-DUSE_FAST_PATH -DTILE=16");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_DEVICES, "GPU"),
            (ENV_PLATFORM, "2"),
            (ENV_SAVE_BINARIES, "/tmp/bins"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert!(config.device_restriction.gpu && !config.device_restriction.cpu);
        assert_eq!(config.platform_index, 2);
        assert!(config.save_binaries());

        let bad = Config::from_lookup(|k| (k == ENV_PLATFORM).then(|| "first".to_string()));
        assert!(bad.is_err());
    }
}
