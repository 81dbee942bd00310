pub use crate::config::{Config, ConfigBuilder};
pub use crate::context::{ChannelLayout, ComputeContext, ElementType};
pub use crate::device::{Device, DeviceRestriction, DeviceSelector, DeviceSlot};
pub use crate::dispatch::ExecutionGrid;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::events::RuntimeEvent;
pub use crate::kernel::{KernelId, KernelInfo};
pub use crate::memory::{BufferId, BufferInfo, HostMemory, MappedBuffer, MemFlags};
pub use crate::runtime::Runtime;
pub use crate::source::{FsSourceLoader, MemorySourceLoader, SourceLoader};

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};
