//! VEDA-CL - heterogeneous compute-device runtime
//!
//! Discovers compute platforms and devices, builds one context with a
//! command queue per accepted device, compiles kernels for every device,
//! and manages buffers and images together with the bookkeeping that ties
//! them to kernel arguments.
//!
//! # Quick Start
//!
//! ```no_run
//! use veda_cl::prelude::*;
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//!
//! let buffer = rt.create_buffer(MemFlags::default(), 4 * 1024, None).unwrap();
//! rt.fill_u32(buffer, 7, 1024).unwrap();
//!
//! let words: Vec<u32> = rt.read_buffer_vec(buffer).unwrap();
//! assert!(words.iter().all(|&w| w == 7));
//! ```
//!
//! # Features
//!
//! - **Device Catalog**: Platform and device enumeration with fastest-device scoring
//! - **Per-Device Builds**: Kernels built for every context device, with binaries saved on request
//! - **Memory Objects**: Buffers, sub-buffers and images with copy-on-use, read-back and delete-after-use
//! - **Graphics Sharing**: Automatic or manual acquire/release around dispatches
//! - **Telemetry**: Dispatch and transfer metrics (optional)
//! - **Host Fallback**: In-process host platform when no native device is usable (optional)

#![warn(missing_debug_implementations)]

pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod kernel;
pub mod memory;
pub mod prelude;
pub mod runtime;
pub mod source;
pub mod telemetry;
pub mod util;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder};
pub use error::{Error, ErrorKind, Result};
pub use runtime::Runtime;
