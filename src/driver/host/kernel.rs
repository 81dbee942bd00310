//! Host kernel functions and their invocation context.

use crate::dispatch::ExecutionGrid;
use crate::driver::DeviceType;
use crate::memory::HostMemory;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

/// The body of a kernel executed by the host driver.
///
/// One call covers the whole grid; use
/// [`HostInvocation::for_each_global_id`] to walk it.
pub type HostKernelFn = dyn Fn(&mut HostInvocation<'_>) -> Result<(), String> + Send + Sync;

/// A window into host storage: a whole allocation or a sub-range of it.
#[derive(Debug, Clone)]
pub(crate) struct Storage {
    pub(crate) data: HostMemory,
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

impl Storage {
    pub(crate) fn whole(data: HostMemory) -> Self {
        let len = data.len();
        Self {
            data,
            offset: 0,
            len,
        }
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        (end <= self.len).then(|| Self {
            data: self.data.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    pub(crate) fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let data = self.data.read();
        data.get(self.offset + offset..self.offset + end).map(<[u8]>::to_vec)
    }

    pub(crate) fn write(&self, offset: usize, src: &[u8]) -> bool {
        match offset.checked_add(src.len()) {
            Some(end) if end <= self.len => self.data.fill_from(self.offset + offset, src),
            _ => false,
        }
    }
}

/// A resolved kernel argument.
#[derive(Debug, Clone)]
pub(crate) enum HostArg {
    Mem(Storage),
    Bytes(Vec<u8>),
}

/// What a host kernel sees when it runs.
pub struct HostInvocation<'a> {
    pub(crate) grid: ExecutionGrid,
    pub(crate) args: &'a [HostArg],
    pub(crate) defines: &'a HashMap<String, String>,
    pub(crate) device_type: DeviceType,
}

impl HostInvocation<'_> {
    pub fn grid(&self) -> &ExecutionGrid {
        &self.grid
    }

    pub fn global_size(&self, dim: usize) -> usize {
        self.grid.global.get(dim).copied().unwrap_or(1)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// A `-D` define the program was built with.
    pub fn define(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }

    pub fn define_or<T: FromStr>(&self, name: &str, default: T) -> T {
        self.define(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    fn arg(&self, index: usize) -> Result<&HostArg, String> {
        self.args
            .get(index)
            .ok_or_else(|| format!("argument #{index} does not exist"))
    }

    fn storage(&self, index: usize) -> Result<&Storage, String> {
        match self.arg(index)? {
            HostArg::Mem(storage) => Ok(storage),
            HostArg::Bytes(_) => Err(format!("argument #{index} is not a memory object")),
        }
    }

    /// Read a by-value argument.
    pub fn scalar<T: bytemuck::Pod>(&self, index: usize) -> Result<T, String> {
        match self.arg(index)? {
            HostArg::Bytes(bytes) => bytemuck::try_pod_read_unaligned(bytes)
                .map_err(|e| format!("argument #{index}: {e}")),
            HostArg::Mem(_) => Err(format!("argument #{index} is a memory object")),
        }
    }

    pub fn buffer_len(&self, index: usize) -> Result<usize, String> {
        Ok(self.storage(index)?.len)
    }

    /// Copy a memory argument out as `T`s.
    pub fn read<T: bytemuck::Pod>(&self, index: usize) -> Result<Vec<T>, String> {
        let storage = self.storage(index)?;
        let whole = storage.len - storage.len % std::mem::size_of::<T>().max(1);
        let bytes = storage
            .read(0, whole)
            .ok_or_else(|| format!("argument #{index}: storage shrank"))?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Write `data` into a memory argument starting at element `offset`.
    pub fn write<T: bytemuck::Pod>(
        &self,
        index: usize,
        offset: usize,
        data: &[T],
    ) -> Result<(), String> {
        let storage = self.storage(index)?;
        let byte_offset = offset * std::mem::size_of::<T>();
        if storage.write(byte_offset, bytemuck::cast_slice(data)) {
            Ok(())
        } else {
            Err(format!(
                "argument #{index}: write of {} elements at {offset} overruns {} bytes",
                data.len(),
                storage.len
            ))
        }
    }

    /// Call `f` once per global id in the grid, x fastest.
    pub fn for_each_global_id<F: FnMut([usize; 3])>(&self, mut f: F) {
        let [gx, gy, gz] = self.grid.global;
        for z in 0..gz {
            for y in 0..gy {
                for x in 0..gx {
                    f([x, y, z]);
                }
            }
        }
    }
}

pub(crate) type HostKernelTable = HashMap<String, Arc<HostKernelFn>>;

/// Host bodies for the runtime's internal kernels.
pub(crate) fn builtin_kernels() -> HostKernelTable {
    let mut table: HostKernelTable = HashMap::new();

    table.insert(
        "fill_u32".to_string(),
        Arc::new(|inv: &mut HostInvocation<'_>| {
            let value: u32 = inv.scalar(1)?;
            let count: u32 = inv.scalar(2)?;
            let capacity = inv.buffer_len(0)? / 4;
            let batch = inv.define_or("FILL_BATCH", 1usize).max(1);
            let n = (count as usize).min(capacity);
            let mut start = 0;
            while start < n {
                let end = (start + batch).min(n);
                inv.write(0, start, &vec![value; end - start])?;
                start = end;
            }
            Ok(())
        }),
    );

    table.insert(
        "copy_bytes".to_string(),
        Arc::new(|inv: &mut HostInvocation<'_>| {
            let count: u32 = inv.scalar(2)?;
            let src: Vec<u8> = inv.read(0)?;
            let n = (count as usize).min(src.len()).min(inv.buffer_len(1)?);
            inv.write(1, 0, &src[..n])
        }),
    );

    table.insert(
        "scale_f32".to_string(),
        Arc::new(|inv: &mut HostInvocation<'_>| {
            let factor: f32 = inv.scalar(1)?;
            let count: u32 = inv.scalar(2)?;
            let mut data: Vec<f32> = inv.read(0)?;
            let n = (count as usize).min(data.len());
            for value in &mut data[..n] {
                *value *= factor;
            }
            inv.write(0, 0, &data[..n])
        }),
    );

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke(name: &str, args: &[HostArg]) -> Result<(), String> {
        let table = builtin_kernels();
        let defines = HashMap::new();
        let mut inv = HostInvocation {
            grid: ExecutionGrid::new_1d(64, 64),
            args,
            defines: &defines,
            device_type: DeviceType::Cpu,
        };
        (table[name])(&mut inv)
    }

    #[test]
    fn test_fill_u32() {
        let mem = HostMemory::zeroed(16);
        let args = vec![
            HostArg::Mem(Storage::whole(mem.clone())),
            HostArg::Bytes(7u32.to_ne_bytes().to_vec()),
            HostArg::Bytes(3u32.to_ne_bytes().to_vec()),
        ];
        invoke("fill_u32", &args).unwrap();
        assert_eq!(mem.to_typed::<u32>(), vec![7, 7, 7, 0]);
    }

    #[test]
    fn test_scale_on_sub_range() {
        let mem = HostMemory::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let view = Storage::whole(mem.clone()).slice(8, 8).unwrap();
        let args = vec![
            HostArg::Mem(view),
            HostArg::Bytes(2.0f32.to_ne_bytes().to_vec()),
            HostArg::Bytes(2u32.to_ne_bytes().to_vec()),
        ];
        invoke("scale_f32", &args).unwrap();
        assert_eq!(mem.to_typed::<f32>(), vec![1.0, 2.0, 6.0, 8.0]);
    }

    #[test]
    fn test_scalar_type_mismatch() {
        let args = vec![HostArg::Bytes(vec![1, 2])];
        let defines = HashMap::new();
        let inv = HostInvocation {
            grid: ExecutionGrid::new_1d(1, 1),
            args: &args,
            defines: &defines,
            device_type: DeviceType::Gpu,
        };
        assert!(inv.scalar::<u32>(0).is_err());
        assert!(inv.scalar::<u16>(0).is_ok());
        assert!(inv.buffer_len(0).is_err());
        assert!(inv.scalar::<u8>(3).is_err());
    }
}
