//! Per-file attribute side channel
//!
//! The disk engine keeps two kinds of data beside each payload file: the
//! caller's metadata and the last-access stamp used for LRU ordering. Both
//! live in a small name → bytes map keyed by the payload path. How that map
//! persists is up to the [`AttributeStore`] implementation.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name prefix of sidecar documents still being written
const STAGED_PREFIX: &str = ".tmp";

/// Attribute name → opaque value
pub type Attributes = BTreeMap<String, Vec<u8>>;

/// Key/value attribute store scoped to payload paths.
///
/// Paths that never had attributes read back as an empty map. Removing
/// attributes of an unknown path is not an error.
pub trait AttributeStore: Send + Sync {
    fn get(&self, path: &Path) -> io::Result<Attributes>;

    /// Replace every attribute of `path`; an empty map removes them
    fn set(&self, path: &Path, attributes: Attributes) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Drop attributes of every path
    fn clear(&self) -> io::Result<()>;
}

/// Non-persistent attribute index held in process memory
#[derive(Default)]
pub struct MemoryAttributes {
    index: RwLock<HashMap<PathBuf, Attributes>>,
}

impl MemoryAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of paths carrying attributes
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttributeStore for MemoryAttributes {
    fn get(&self, path: &Path) -> io::Result<Attributes> {
        Ok(self.index.read().get(path).cloned().unwrap_or_default())
    }

    fn set(&self, path: &Path, attributes: Attributes) -> io::Result<()> {
        let mut index = self.index.write();
        if attributes.is_empty() {
            index.remove(path);
        } else {
            index.insert(path.to_path_buf(), attributes);
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.index.write().remove(path);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        self.index.write().clear();
        Ok(())
    }
}

/// Attributes persisted as one JSON document per payload file
pub struct SidecarAttributes {
    directory: PathBuf,
}

impl SidecarAttributes {
    /// Open (creating if needed) a sidecar directory.
    ///
    /// Documents left half-written by an interrupted `set` are deleted.
    pub fn open(directory: impl Into<PathBuf>) -> io::Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Self::clean_staged(&directory)?;
        Ok(Self { directory })
    }

    fn clean_staged(directory: &Path) -> io::Result<()> {
        let mut cleaned = 0u64;
        for entry in fs::read_dir(directory)?.flatten() {
            let staged = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGED_PREFIX));
            if !staged {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to clean staged sidecar")
                }
            }
        }
        if cleaned > 0 {
            info!(dir = %directory.display(), cleaned, "Cleaned orphaned sidecar files");
        }
        Ok(())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn sidecar_path(&self, path: &Path) -> io::Result<PathBuf> {
        let name = path.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path has no file name: {}", path.display()),
            )
        })?;
        let mut sidecar = name.to_os_string();
        sidecar.push(".json");
        Ok(self.directory.join(sidecar))
    }
}

impl AttributeStore for SidecarAttributes {
    fn get(&self, path: &Path) -> io::Result<Attributes> {
        let sidecar = self.sidecar_path(path)?;
        match fs::read(&sidecar) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Attributes::new()),
            Err(e) => Err(e),
        }
    }

    fn set(&self, path: &Path, attributes: Attributes) -> io::Result<()> {
        if attributes.is_empty() {
            return self.remove(path);
        }

        let sidecar = self.sidecar_path(path)?;
        let json = serde_json::to_vec(&attributes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut staged = tempfile::Builder::new()
            .prefix(STAGED_PREFIX)
            .tempfile_in(&self.directory)?;
        staged.write_all(&json)?;
        staged.persist(&sidecar).map_err(|e| e.error)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let sidecar = self.sidecar_path(path)?;
        match fs::remove_file(&sidecar) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn clear(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}
