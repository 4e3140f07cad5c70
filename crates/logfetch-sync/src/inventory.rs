//! In-memory inventory of remote log folders and their files.
//!
//! Identity is the name alone: two entries with the same name are the same
//! entry whatever their size, state, or owning endpoint. That is what lets
//! listings from several endpoints collapse into one inventory.

use logfetch_core::SyncState;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

// ── Entries ──────────────────────────────────────────────────────────────────

/// A remote file, or a directory of files one level below a folder
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    /// Remote path relative to the endpoint root ("20240101/Data.lsf")
    pub name: String,
    /// `None` while unknown; for directories, the sum of the children
    pub size: Option<u64>,
    pub state: SyncState,
    /// Key of the endpoint that serves this entry
    pub endpoint: String,
    pub is_dir: bool,
    pub children: Vec<FileEntry>,
}

impl FileEntry {
    pub fn file(name: impl Into<String>, size: u64, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: Some(size),
            state: SyncState::New,
            endpoint: endpoint.into(),
            is_dir: false,
            children: Vec::new(),
        }
    }

    /// Directory entry whose size is the sum of `children`.
    pub fn directory(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        children: Vec<FileEntry>,
    ) -> Self {
        let mut dir = Self {
            name: name.into(),
            size: None,
            state: SyncState::New,
            endpoint: endpoint.into(),
            is_dir: true,
            children,
        };
        dir.size = Some(dir.children_size());
        dir
    }

    /// Last path component
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn children_size(&self) -> u64 {
        self.children.iter().filter_map(|c| c.size).sum()
    }
}

impl PartialEq for FileEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for FileEntry {}

impl Hash for FileEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// One remote log folder
#[derive(Debug, Clone, Serialize)]
pub struct FolderEntry {
    pub name: String,
    pub state: SyncState,
    /// Endpoints that reported this folder in the last listing
    pub endpoints: BTreeSet<String>,
    files: Vec<FileEntry>,
}

impl FolderEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: SyncState::New,
            endpoints: BTreeSet::new(),
            files: Vec::new(),
        }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = &mut FileEntry> {
        self.files.iter_mut()
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn file_mut(&mut self, name: &str) -> Option<&mut FileEntry> {
        self.files.iter_mut().find(|f| f.name == name)
    }

    /// Adds `file` unless an entry with the same name exists.
    pub fn add_file(&mut self, file: FileEntry) -> bool {
        if self.files.contains(&file) {
            return false;
        }
        self.files.push(file);
        true
    }

    pub fn remove_file(&mut self, name: &str) -> Option<FileEntry> {
        let idx = self.files.iter().position(|f| f.name == name)?;
        Some(self.files.remove(idx))
    }

    pub fn retain_files(&mut self, keep: impl FnMut(&FileEntry) -> bool) {
        self.files.retain(keep);
    }

    /// Recompute the folder state from its files; true if it changed.
    pub fn refresh_state(&mut self) -> bool {
        let next = derive_state(self.files.iter().map(|f| f.state));
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Mark the folder and every file `Local`.
    pub fn mark_local(&mut self) {
        self.state = SyncState::Local;
        for f in &mut self.files {
            f.state = SyncState::Local;
        }
    }

    /// Space-joined endpoint keys
    pub fn presence(&self) -> String {
        self.endpoints
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl PartialEq for FolderEntry {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for FolderEntry {}

impl Hash for FolderEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

// ── State derivation ─────────────────────────────────────────────────────────

/// Aggregate state of a collection of entries. A priority cascade: the first
/// matching rule wins. An empty collection is `Sync`.
pub fn derive_state<I: IntoIterator<Item = SyncState>>(states: I) -> SyncState {
    let (mut total, mut downloading, mut error, mut new, mut incomplete) = (0, 0, 0, 0, 0);
    let (mut local, mut sync, mut unknown) = (0, 0, 0);
    for s in states {
        total += 1;
        match s {
            SyncState::Downloading => downloading += 1,
            SyncState::Error => error += 1,
            SyncState::New => new += 1,
            SyncState::Incomplete => incomplete += 1,
            SyncState::Sync => sync += 1,
            SyncState::Unknown => unknown += 1,
            SyncState::Local => local += 1,
        }
    }

    if downloading > 0 {
        SyncState::Downloading
    } else if error > 0 {
        SyncState::Error
    } else if sync == total {
        SyncState::Sync
    } else if new + local == total {
        SyncState::New
    } else if sync + incomplete + unknown + new + local == total {
        SyncState::Incomplete
    } else if local == total {
        SyncState::Local
    } else if new == total {
        SyncState::New
    } else {
        SyncState::Unknown
    }
}

// ── Inventory ────────────────────────────────────────────────────────────────

/// All known folders, ordered by name
#[derive(Debug, Default, Clone)]
pub struct Inventory {
    folders: BTreeMap<String, FolderEntry>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.folders.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&FolderEntry> {
        self.folders.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FolderEntry> {
        self.folders.get_mut(name)
    }

    /// Folder lookup ignoring ASCII case
    pub fn find(&self, name: &str) -> Option<&FolderEntry> {
        self.folders
            .get(name)
            .or_else(|| self.folders.values().find(|f| f.name.eq_ignore_ascii_case(name)))
    }

    /// Inserts `folder` unless one with the same name exists.
    pub fn insert(&mut self, folder: FolderEntry) -> bool {
        if self.folders.contains_key(&folder.name) {
            return false;
        }
        self.folders.insert(folder.name.clone(), folder);
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<FolderEntry> {
        self.folders.remove(name)
    }

    pub fn clear(&mut self) {
        self.folders.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.folders.keys().cloned().collect()
    }

    pub fn folders(&self) -> impl Iterator<Item = &FolderEntry> {
        self.folders.values()
    }

    pub fn folders_mut(&mut self) -> impl Iterator<Item = &mut FolderEntry> {
        self.folders.values_mut()
    }

    /// Folder and file holding the file named `file`
    pub fn locate_file(&self, file: &str) -> Option<(&FolderEntry, &FileEntry)> {
        self.folders
            .values()
            .find_map(|folder| folder.file(file).map(|f| (folder, f)))
    }

    /// One representative state for the whole inventory; `None` when empty.
    pub fn summary(&self) -> Option<SyncState> {
        if self.folders.is_empty() {
            return None;
        }
        Some(derive_state(self.folders.values().map(|f| f.state)))
    }
}
