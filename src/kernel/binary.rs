//! Writing program binaries to disk.
//!
//! Everything here is best-effort: a failure is reported to the caller,
//! which logs it and carries on.

use crate::device::PlatformVendor;
use crate::driver::host::BITCODE_WRAPPER_MAGIC;
use crate::driver::{Driver, ProgramHandle};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

pub fn binary_extension(platform: PlatformVendor) -> &'static str {
    match platform {
        PlatformVendor::Nvidia => "ptx",
        PlatformVendor::Amd => "elf",
        PlatformVendor::Apple => "bc",
        _ => "bin",
    }
}

/// `<entry>_<device index>.<ext>`
pub fn binary_file_name(entry: &str, device_index: usize, platform: PlatformVendor) -> String {
    format!("{entry}_{device_index}.{}", binary_extension(platform))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// The bitcode payload of a wrapped binary. Anything that is not a
/// well-formed wrapper is returned unchanged.
pub fn unwrap_bitcode(bytes: &[u8]) -> &[u8] {
    if read_u32(bytes, 0) != Some(BITCODE_WRAPPER_MAGIC) {
        return bytes;
    }
    let payload = read_u32(bytes, 8).zip(read_u32(bytes, 12)).and_then(|(offset, size)| {
        let start = offset as usize;
        bytes.get(start..start.checked_add(size as usize)?)
    });
    payload.unwrap_or(bytes)
}

/// Write one device's program binary into `dir`, then post-process it.
pub(crate) fn save_binary(
    driver: &dyn Driver,
    program: ProgramHandle,
    dir: &Path,
    entry: &str,
    device_index: usize,
    platform: PlatformVendor,
    disassembler: Option<&Path>,
) -> Result<PathBuf> {
    let binary = driver
        .program_binary(program)
        .map_err(|source| Error::native("program_binary", source))?;
    let bytes = match platform {
        PlatformVendor::Apple => unwrap_bitcode(&binary),
        _ => &binary[..],
    };

    std::fs::create_dir_all(dir)?;
    let path = dir.join(binary_file_name(entry, device_index, platform));
    std::fs::write(&path, bytes)?;
    debug!("wrote {} bytes to {}", bytes.len(), path.display());

    if platform == PlatformVendor::Amd {
        if let Some(tool) = disassembler {
            disassemble(tool, &path);
        }
    }
    Ok(path)
}

/// Run `tool <binary>` and keep its output next to the binary as `.s`.
fn disassemble(tool: &Path, binary: &Path) {
    match Command::new(tool).arg(binary).output() {
        Ok(output) if output.status.success() => {
            let listing = binary.with_extension("s");
            if let Err(err) = std::fs::write(&listing, &output.stdout) {
                warn!("writing {} failed: {err}", listing.display());
            }
        }
        Ok(output) => warn!(
            "{} exited with {} on {}",
            tool.display(),
            output.status,
            binary.display()
        ),
        Err(err) => warn!("could not run {}: {err}", tool.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&BITCODE_WRAPPER_MAGIC.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&20u32.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&7u32.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_unwrap() {
        let wrapped = wrap(b"BC\xC0\xDEbody");
        assert_eq!(unwrap_bitcode(&wrapped), b"BC\xC0\xDEbody");
        assert_eq!(unwrap_bitcode(b"plain"), b"plain");

        let mut truncated = wrap(b"0123456789");
        truncated.truncate(24);
        assert_eq!(unwrap_bitcode(&truncated), &truncated[..]);
    }

    #[test]
    fn test_file_names() {
        assert_eq!(binary_file_name("saxpy", 1, PlatformVendor::Nvidia), "saxpy_1.ptx");
        assert_eq!(binary_file_name("saxpy", 0, PlatformVendor::Amd), "saxpy_0.elf");
        assert_eq!(binary_file_name("saxpy", 0, PlatformVendor::Apple), "saxpy_0.bc");
        assert_eq!(binary_file_name("saxpy", 2, PlatformVendor::Host), "saxpy_2.bin");
    }
}
