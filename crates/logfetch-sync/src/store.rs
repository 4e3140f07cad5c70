//! Local mirror of the remote endpoint roots: `{base_dir}/{label}/{remote path}`

use logfetch_core::config::StorageConfig;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

use crate::inventory::FileEntry;

/// Free and total bytes on the volume holding the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub available: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self::new(cfg.local_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for a remote path. Only normal components are kept, so a
    /// hostile listing cannot escape the store with `..` or absolute names.
    pub fn target(&self, remote: &str) -> PathBuf {
        let mut path = self.root.clone();
        for comp in Path::new(remote).components() {
            if let Component::Normal(part) = comp {
                path.push(part);
            }
        }
        path
    }

    /// Length of the local regular file for `remote`, if any
    pub fn file_len(&self, remote: &str) -> Option<u64> {
        std::fs::metadata(self.target(remote))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    pub fn exists(&self, remote: &str) -> bool {
        self.target(remote).exists()
    }

    /// Bytes on disk for an entry: the file length, or for a directory the
    /// sum of its children present locally. `None` when the target is missing.
    pub fn disk_size(&self, entry: &FileEntry) -> Option<u64> {
        if !entry.is_dir {
            return self.file_len(&entry.name);
        }
        if !self.target(&entry.name).is_dir() {
            return None;
        }
        Some(
            entry
                .children
                .iter()
                .filter_map(|c| self.file_len(&c.name))
                .sum(),
        )
    }

    /// Free space on the volume of the store, measured at the nearest
    /// existing ancestor since the store itself is created lazily.
    pub fn disk_space(&self) -> Option<DiskSpace> {
        let existing = self
            .root
            .ancestors()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let available = fs2::available_space(&existing).ok()?;
        let total = fs2::total_space(&existing).ok()?;
        Some(DiskSpace { available, total })
    }
}
