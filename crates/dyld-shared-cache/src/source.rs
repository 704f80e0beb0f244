//! Filesystem resolution the dependency graph (C3) needs: overlay root then
//! base root, `@executable_path`/`@loader_path` expansion, and canonical
//! path comparison. Grounded on `add_root`/`load_dependencies` in
//! `launch-cache/CacheFileAbstraction.hpp`'s root/overlay resolution order.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Where to find dylib bytes for a virtual install-name-shaped path.
pub trait DylibSource {
    fn read(&self, virtual_path: &str) -> Result<Vec<u8>>;
    /// A string uniquely identifying the real file `virtual_path` resolves
    /// to (realpath on a real filesystem source).
    fn canonicalize(&self, virtual_path: &str) -> Result<String>;
}

/// Resolves against an optional overlay root, then an optional base root,
/// then the raw path, in that order (§4.3 `add_root`).
pub struct FilesystemSource {
    pub overlay_root: Option<PathBuf>,
    pub base_root: Option<PathBuf>,
}

impl FilesystemSource {
    pub fn new(overlay_root: Option<PathBuf>, base_root: Option<PathBuf>) -> Self {
        FilesystemSource { overlay_root, base_root }
    }

    fn candidates(&self, virtual_path: &str) -> Vec<PathBuf> {
        let trimmed = virtual_path.trim_start_matches('/');
        let mut out = Vec::new();
        if let Some(root) = &self.overlay_root {
            out.push(root.join(trimmed));
        }
        if let Some(root) = &self.base_root {
            out.push(root.join(trimmed));
        }
        out.push(PathBuf::from(virtual_path));
        out
    }

    fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        for candidate in self.candidates(virtual_path) {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::resolution(format!("{virtual_path} not found under any root")))
    }
}

impl DylibSource for FilesystemSource {
    fn read(&self, virtual_path: &str) -> Result<Vec<u8>> {
        let path = self.resolve(virtual_path)?;
        let file = fs::File::open(&path).map_err(|e| Error::resolution(format!("{}: {e}", path.display())))?;
        let mapped = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| Error::resolution(format!("{}: {e}", path.display())))?;
        Ok(mapped.to_vec())
    }

    fn canonicalize(&self, virtual_path: &str) -> Result<String> {
        let path = self.resolve(virtual_path)?;
        let real = fs::canonicalize(&path).map_err(|e| Error::resolution(format!("{}: {e}", path.display())))?;
        Ok(real.to_string_lossy().into_owned())
    }
}

/// An in-memory source used by tests and by any caller that has already
/// loaded its dylibs, keyed by install name.
#[derive(Default)]
pub struct MapSource {
    pub files: HashMap<String, Vec<u8>>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, virtual_path: impl Into<String>, data: Vec<u8>) {
        self.files.insert(virtual_path.into(), data);
    }
}

impl DylibSource for MapSource {
    fn read(&self, virtual_path: &str) -> Result<Vec<u8>> {
        self.files
            .get(virtual_path)
            .cloned()
            .ok_or_else(|| Error::resolution(format!("{virtual_path} not found in source map")))
    }

    fn canonicalize(&self, virtual_path: &str) -> Result<String> {
        if self.files.contains_key(virtual_path) {
            Ok(virtual_path.to_string())
        } else {
            Err(Error::resolution(format!("{virtual_path} not found in source map")))
        }
    }
}

/// Expands `@executable_path/` and `@loader_path/`; rejects `@rpath/`
/// (Non-goal, §1).
pub fn expand_path_variable(dep_name: &str, executable_path: &str, loader_path: &str) -> Result<String> {
    if let Some(rest) = dep_name.strip_prefix("@executable_path/") {
        Ok(join_dir(executable_path, rest))
    } else if let Some(rest) = dep_name.strip_prefix("@loader_path/") {
        Ok(join_dir(loader_path, rest))
    } else if dep_name.starts_with("@rpath/") {
        Err(Error::unsupported("@rpath is not supported by this builder"))
    } else {
        Ok(dep_name.to_string())
    }
}

fn join_dir(path: &str, rest: &str) -> String {
    let dir = Path::new(path).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
    format!("{dir}/{rest}")
}
