//! Remote inventory reconciliation.
//!
//! One run fans out to every available endpoint for its base listing, merges
//! the answers into a presence map (folder -> endpoints that report it), and
//! then walks the folders newest-first, fetching each folder's files from the
//! endpoints that reported it and folding them into the inventory. Remote I/O
//! happens without the inventory lock; the lock is taken only to apply an
//! already merged result, so a cancelled run leaves earlier updates intact.

use futures::future::join_all;
use logfetch_core::config::ListingConfig;
use logfetch_core::{LogFetchError, LogFetchResult, SyncState};
use logfetch_endpoint::{Endpoint, EndpointRegistry};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{DownloaderEvent, EventBus, ListingPhase};
use crate::inventory::{FileEntry, FolderEntry, Inventory};
use crate::store::LocalStore;

/// Folder name -> keys of the endpoints reporting it
pub type Presence = BTreeMap<String, BTreeSet<String>>;

/// What one reconciliation run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub endpoints_listed: Vec<String>,
    pub endpoints_failed: Vec<String>,
    /// Newest folder, left out as the log still being written
    pub active: Option<String>,
    pub new_folders: usize,
    pub local_folders: usize,
    pub folders_updated: usize,
    pub cancelled: bool,
}

// ── Pure merge helpers ───────────────────────────────────────────────────────

/// Merge per-endpoint base listings into a presence map. The result does not
/// depend on the order of `listings`.
pub fn merge_presence(listings: &[(String, Vec<String>)]) -> Presence {
    let mut presence = Presence::new();
    for (key, folders) in listings {
        for folder in folders {
            presence
                .entry(folder.clone())
                .or_default()
                .insert(key.clone());
        }
    }
    presence
}

/// Remove the lexicographically last folder, the one still being written.
pub fn split_active(presence: &mut Presence) -> Option<String> {
    let last = presence.keys().next_back().cloned()?;
    presence.remove(&last);
    Some(last)
}

/// Merge per-endpoint file listings of one folder. Entries are identified by
/// name; for duplicates the endpoint with the smallest key wins.
pub fn merge_files(mut listings: Vec<(String, Vec<FileEntry>)>) -> Vec<FileEntry> {
    listings.sort_by(|a, b| a.0.cmp(&b.0));
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for (_, files) in listings {
        for file in files {
            if seen.insert(file.name.clone()) {
                merged.push(file);
            }
        }
    }
    merged.sort_by(|a, b| a.name.cmp(&b.name));
    merged
}

/// State of a file seen for the first time, judged by the local copy.
fn initial_state(entry: &FileEntry, store: &LocalStore) -> SyncState {
    match store.disk_size(entry) {
        None => SyncState::New,
        Some(len) if Some(len) == entry.size => SyncState::Sync,
        Some(_) => SyncState::Incomplete,
    }
}

/// Replace the children of a known directory with the listed ones, keeping
/// known child state. True if a child appeared that was not known before.
fn merge_children(known: &mut FileEntry, listed: Vec<FileEntry>) -> bool {
    let names: HashSet<&str> = listed.iter().map(|c| c.name.as_str()).collect();
    known.children.retain(|c| names.contains(c.name.as_str()));
    let mut added = false;
    for child in listed {
        match known.children.iter_mut().find(|c| c.name == child.name) {
            Some(existing) => existing.size = child.size,
            None => {
                known.children.push(child);
                added = true;
            }
        }
    }
    known.size = Some(known.children_size());
    added
}

fn update_known(known: &mut FileEntry, incoming: FileEntry) {
    known.endpoint = incoming.endpoint;
    let size_changed = known.size != incoming.size;

    let mut grew = false;
    if known.is_dir && incoming.is_dir {
        grew = merge_children(known, incoming.children);
    }
    known.size = incoming.size;

    if known.state == SyncState::Downloading {
        return;
    }
    if grew && matches!(known.state, SyncState::Sync | SyncState::Local) {
        known.state = SyncState::Incomplete;
    } else if !size_changed {
        if known.state == SyncState::Local {
            known.state = SyncState::Sync;
        }
    } else if matches!(known.state, SyncState::Sync | SyncState::Local) {
        known.state = SyncState::Incomplete;
    }
}

fn check_local(known: &mut FileEntry, store: &LocalStore) {
    match store.disk_size(known) {
        None => {
            if !matches!(known.state, SyncState::New | SyncState::Downloading) {
                known.state = SyncState::Incomplete;
            }
        }
        Some(len) if Some(len) == known.size => {
            if matches!(
                known.state,
                SyncState::New | SyncState::Incomplete | SyncState::Unknown
            ) {
                known.state = SyncState::Sync;
            }
        }
        Some(_) => {
            if known.state == SyncState::Sync {
                known.state = SyncState::Incomplete;
            }
        }
    }
}

/// Fold a fresh remote listing into a known folder. Returns the files whose
/// state changed (including newly added ones).
pub fn reconcile_files(
    folder: &mut FolderEntry,
    remote: Vec<FileEntry>,
    store: &LocalStore,
) -> Vec<(String, SyncState)> {
    let listed: HashSet<String> = remote.iter().map(|f| f.name.clone()).collect();
    let mut changed = Vec::new();

    for mut incoming in remote {
        match folder.file_mut(&incoming.name) {
            None => {
                incoming.state = initial_state(&incoming, store);
                changed.push((incoming.name.clone(), incoming.state));
                folder.add_file(incoming);
            }
            Some(known) => {
                let before = known.state;
                update_known(known, incoming);
                check_local(known, store);
                if known.state != before {
                    changed.push((known.name.clone(), known.state));
                }
            }
        }
    }

    for file in folder.files_mut() {
        if !listed.contains(&file.name) && file.state != SyncState::Local {
            file.state = SyncState::Local;
            changed.push((file.name.clone(), SyncState::Local));
        }
    }
    folder.retain_files(|f| listed.contains(&f.name) || store.exists(&f.name));
    changed
}

// ── Reconciler ───────────────────────────────────────────────────────────────

pub struct Reconciler {
    registry: Arc<EndpointRegistry>,
    store: LocalStore,
    options: ListingConfig,
    events: EventBus,
}

impl Reconciler {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        store: LocalStore,
        options: ListingConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            store,
            options,
            events,
        }
    }

    /// One full listing pass. Per-endpoint failures are logged and isolated;
    /// the run itself never fails.
    pub async fn run(&self, inventory: &Mutex<Inventory>, token: &CancellationToken) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.phase(ListingPhase::Starting);

        // ── Base listings ──
        self.phase(ListingPhase::Connecting);
        let keys = self.registry.available_keys();
        let results = join_all(keys.iter().map(|key| self.list_base(key))).await;
        let mut listings = Vec::with_capacity(keys.len());
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(folders) => {
                    debug!(endpoint = %key, folders = folders.len(), "base listing");
                    report.endpoints_listed.push(key.clone());
                    listings.push((key.clone(), folders));
                }
                Err(e) => {
                    warn!(endpoint = %key, error = %e, "base listing failed, skipping endpoint");
                    report.endpoints_failed.push(key.clone());
                }
            }
        }
        if token.is_cancelled() {
            return self.cancelled(report);
        }
        if listings.is_empty() {
            warn!(configured = keys.len(), "no endpoint answered, inventory left unchanged");
            self.events
                .emit(DownloaderEvent::Message("no log server reachable".into()));
            self.phase(ListingPhase::Done);
            return report;
        }

        // ── Merge and fold presence ──
        self.phase(ListingPhase::Filtering);
        let mut presence = merge_presence(&listings);
        if self.options.ignore_active_log {
            report.active = split_active(&mut presence);
            if let Some(active) = &report.active {
                debug!(folder = %active, "ignoring active log");
            }
        }
        {
            let mut inv = inventory.lock().unwrap();
            self.fold_presence(&mut inv, &presence, &mut report);
        }

        // ── Per-folder contents, newest first ──
        let total = presence.len();
        for (index, (folder, endpoints)) in presence.iter().rev().enumerate() {
            if token.is_cancelled() {
                return self.cancelled(report);
            }
            self.phase(ListingPhase::Processing {
                folder: folder.clone(),
                index: index + 1,
                total,
            });

            let Some(remote) = self.list_folder(folder, endpoints).await else {
                continue;
            };
            if token.is_cancelled() {
                return self.cancelled(report);
            }

            self.phase(ListingPhase::Updating {
                folder: folder.clone(),
            });
            {
                let mut inv = inventory.lock().unwrap();
                if let Some(entry) = inv.get_mut(folder) {
                    let changed = reconcile_files(entry, remote, &self.store);
                    for (file, state) in changed {
                        self.events.emit(DownloaderEvent::FileState {
                            folder: folder.clone(),
                            file,
                            state,
                        });
                    }
                    entry.refresh_state();
                    self.events.emit(DownloaderEvent::FolderState {
                        folder: folder.clone(),
                        state: entry.state,
                    });
                    report.folders_updated += 1;
                }
            }
        }

        let summary = inventory.lock().unwrap().summary();
        self.events.emit(DownloaderEvent::Summary(summary));
        info!(
            folders = total,
            new = report.new_folders,
            local = report.local_folders,
            failed = report.endpoints_failed.len(),
            "listing complete"
        );
        self.phase(ListingPhase::Done);
        report
    }

    fn fold_presence(&self, inv: &mut Inventory, presence: &Presence, report: &mut ReconcileReport) {
        for folder in inv.folders_mut() {
            if presence.contains_key(&folder.name) {
                continue;
            }
            let was_local = folder.state == SyncState::Local;
            folder.mark_local();
            folder.endpoints.clear();
            if !was_local {
                report.local_folders += 1;
                self.events.emit(DownloaderEvent::FolderState {
                    folder: folder.name.clone(),
                    state: SyncState::Local,
                });
            }
        }

        for (name, endpoints) in presence {
            if !inv.contains(name) {
                let mut folder = FolderEntry::new(name.clone());
                if self.store.target(name).is_dir() {
                    folder.state = SyncState::Unknown;
                }
                inv.insert(folder);
                report.new_folders += 1;
            }
            if let Some(folder) = inv.get_mut(name) {
                folder.endpoints = endpoints.clone();
            }
        }
    }

    async fn list_base(&self, key: &str) -> LogFetchResult<Vec<String>> {
        let endpoint = self.endpoint(key)?;
        let entries = endpoint.list_base_entries().await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    /// `None` when no endpoint could list the folder.
    async fn list_folder(&self, folder: &str, endpoints: &BTreeSet<String>) -> Option<Vec<FileEntry>> {
        let results = join_all(
            endpoints
                .iter()
                .map(|key| async move { (key, self.fetch_folder(key, folder).await) }),
        )
        .await;

        let mut listings = Vec::new();
        for (key, result) in results {
            match result {
                Ok(files) => listings.push((key.clone(), files)),
                Err(e) => warn!(endpoint = %key, folder, error = %e, "folder listing failed"),
            }
        }
        if listings.is_empty() {
            return None;
        }
        Some(merge_files(listings))
    }

    async fn fetch_folder(&self, key: &str, folder: &str) -> LogFetchResult<Vec<FileEntry>> {
        let endpoint = self.endpoint(key)?;
        let mut files = Vec::new();
        for entry in endpoint.list_directory(folder).await? {
            if entry.is_dir {
                let children = self.collect_children(&endpoint, &entry.path).await?;
                files.push(FileEntry::directory(entry.path, key, children));
            } else {
                files.push(FileEntry::file(entry.path, entry.size, key));
            }
        }
        Ok(files)
    }

    /// Files below a sub-directory of a folder. The folder's own files sit at
    /// depth 1, a sub-directory's files at depth 2; directories that would
    /// need more than `max_depth` levels are reported and skipped.
    async fn collect_children(&self, endpoint: &Endpoint, dir: &str) -> LogFetchResult<Vec<FileEntry>> {
        let max_depth = self.options.max_depth.max(2);
        let mut out = Vec::new();
        let mut pending = vec![(dir.to_string(), 2usize)];
        while let Some((path, depth)) = pending.pop() {
            for entry in endpoint.list_directory(&path).await? {
                if !entry.is_dir {
                    out.push(FileEntry::file(entry.path, entry.size, endpoint.key()));
                } else if depth < max_depth {
                    pending.push((entry.path, depth + 1));
                } else {
                    warn!(endpoint = %endpoint.key(), path = %entry.path, max_depth, "directory nested too deep, not descending");
                    self.events.emit(DownloaderEvent::DepthLimited {
                        endpoint: endpoint.key().to_string(),
                        path: entry.path,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn endpoint(&self, key: &str) -> LogFetchResult<Arc<Endpoint>> {
        self.registry
            .shared(key)
            .ok_or_else(|| LogFetchError::Config(format!("unknown endpoint: {key}")))
    }

    fn phase(&self, phase: ListingPhase) {
        debug!(%phase, "listing");
        self.events.emit(DownloaderEvent::Listing(phase));
    }

    fn cancelled(&self, mut report: ReconcileReport) -> ReconcileReport {
        info!("listing cancelled");
        report.cancelled = true;
        self.phase(ListingPhase::Cancelled);
        report
    }
}
