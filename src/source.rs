//! Where kernel source text comes from.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Returns kernel source text for a path.
pub trait SourceLoader: Send + Sync + fmt::Debug {
    fn load(&self, path: &Path) -> Result<String>;
}

/// Reads sources from disk; relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct FsSourceLoader {
    root: PathBuf,
}

impl FsSourceLoader {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceLoader for FsSourceLoader {
    fn load(&self, path: &Path) -> Result<String> {
        let full = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        Ok(std::fs::read_to_string(full)?)
    }
}

/// Sources held in memory, for tests and generated kernels.
#[derive(Debug, Default)]
pub struct MemorySourceLoader {
    files: RwLock<HashMap<PathBuf, String>>,
}

impl MemorySourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file<P: Into<PathBuf>, S: Into<String>>(self, path: P, source: S) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert<P: Into<PathBuf>, S: Into<String>>(&self, path: P, source: S) {
        self.files.write().insert(path.into(), source.into());
    }
}

impl SourceLoader for MemorySourceLoader {
    fn load(&self, path: &Path) -> Result<String> {
        self.files.read().get(path).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no in-memory source '{}'", path.display()),
            ))
        })
    }
}

const BUILTIN: &[(&str, &str)] = &[
    ("fill.cl", include_str!("../kernels/fill.cl")),
    ("copy.cl", include_str!("../kernels/copy.cl")),
    ("scale.cl", include_str!("../kernels/scale.cl")),
];

/// The internal kernel sources compiled into the crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSources;

impl BuiltinSources {
    pub fn get(name: &str) -> Option<&'static str> {
        BUILTIN
            .iter()
            .find(|(file, _)| *file == name)
            .map(|(_, source)| *source)
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        BUILTIN.iter().map(|(file, _)| *file)
    }
}

impl SourceLoader for BuiltinSources {
    fn load(&self, path: &Path) -> Result<String> {
        path.to_str()
            .and_then(Self::get)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::invalid_argument(format!("no built-in source '{}'", path.display()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fs_loader_resolves_against_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("k.cl")).unwrap();
        writeln!(file, "__kernel void k(void) {{}}").unwrap();

        let loader = FsSourceLoader::new(dir.path());
        assert!(loader.load(Path::new("k.cl")).unwrap().contains("void k"));
        assert!(loader.load(Path::new("missing.cl")).is_err());
    }

    #[test]
    fn test_builtin_sources() {
        assert_eq!(BuiltinSources::names().count(), 3);
        assert!(BuiltinSources::get("fill.cl").unwrap().contains("fill_u32"));
        assert!(BuiltinSources.load(Path::new("nope.cl")).is_err());
    }

    #[test]
    fn test_memory_loader() {
        let loader = MemorySourceLoader::new().with_file("a.cl", "src");
        assert_eq!(loader.load(Path::new("a.cl")).unwrap(), "src");
    }
}
