//! Download orchestration: the one object a presentation layer talks to.
//!
//! `DownloadOrchestrator` owns the inventory, the admission queue, and the
//! table of live transfer tasks. Every task gets a listener that maps its
//! transfer state onto the inventory, publishes events, and schedules the
//! task's removal once it has been idle for a cooldown.

use anyhow::{bail, Context, Result};
use logfetch_core::config::LogFetchConfig;
use logfetch_core::{SyncState, TransferState};
use logfetch_endpoint::EndpointRegistry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionQueue;
use crate::events::{DownloaderEvent, EventBus};
use crate::inventory::{FileEntry, FolderEntry, Inventory};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::LocalStore;
use crate::transfer::{StateListener, TransferOptions, TransferSource, TransferTask};

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Approves remote deletes. Implemented by whatever presents the engine.
pub trait DeleteConfirmation: Send + Sync {
    fn confirm_remote_delete(&self, targets: &[String]) -> bool;
}

/// Approves every delete
pub struct AlwaysConfirm;

impl DeleteConfirmation for AlwaysConfirm {
    fn confirm_remote_delete(&self, _targets: &[String]) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    config: LogFetchConfig,
    registry: Arc<EndpointRegistry>,
    store: LocalStore,
    inventory: Mutex<Inventory>,
    admission: Arc<AdmissionQueue<String>>,
    tasks: Mutex<HashMap<String, TransferTask>>,
    cleanups: Mutex<HashMap<String, JoinHandle<()>>>,
    events: EventBus,
    reconciler: Reconciler,
    listing: Mutex<Option<CancellationToken>>,
    resetting: AtomicBool,
}

impl DownloadOrchestrator {
    /// FTP-backed orchestrator for `config`.
    pub fn new(config: LogFetchConfig) -> Result<Self> {
        let registry = EndpointRegistry::from_config(&config).context("building endpoint registry")?;
        Ok(Self::with_registry(config, Arc::new(registry)))
    }

    pub fn with_registry(config: LogFetchConfig, registry: Arc<EndpointRegistry>) -> Self {
        let store = LocalStore::from_config(&config.storage);
        let events = EventBus::default();
        let reconciler = Reconciler::new(
            registry.clone(),
            store.clone(),
            config.listing.clone(),
            events.clone(),
        );
        let admission = AdmissionQueue::new(config.download.max_concurrent);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                store,
                inventory: Mutex::new(Inventory::new()),
                admission,
                tasks: Mutex::new(HashMap::new()),
                cleanups: Mutex::new(HashMap::new()),
                events,
                reconciler,
                listing: Mutex::new(None),
                resetting: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &LogFetchConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.shared.registry
    }

    pub fn store(&self) -> &LocalStore {
        &self.shared.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloaderEvent> {
        self.shared.events.subscribe()
    }

    // ── Listing ──────────────────────────────────────────────────────────────

    /// Run one reconciliation pass. Fails if one is already running or a
    /// reset is in progress.
    pub async fn sync_listing(&self) -> Result<ReconcileReport> {
        if self.shared.resetting.load(Ordering::SeqCst) {
            bail!("reset in progress");
        }
        let token = {
            let mut listing = self.shared.listing.lock().unwrap();
            if listing.is_some() {
                bail!("listing already running");
            }
            let token = CancellationToken::new();
            *listing = Some(token.clone());
            token
        };
        let _slot = ListingSlot(&self.shared.listing);

        Ok(self
            .shared
            .reconciler
            .run(&self.shared.inventory, &token)
            .await)
    }

    /// `sync_listing` on a background task; failures become a `Message` event.
    pub fn spawn_sync_listing(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.sync_listing().await {
                warn!(error = %e, "listing not started");
                this.shared
                    .events
                    .emit(DownloaderEvent::Message(format!("listing: {e}")));
            }
        })
    }

    /// Cancel a running listing; it stops at the next folder boundary.
    pub fn stop_listing(&self) -> bool {
        match self.shared.listing.lock().unwrap().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_listing(&self) -> bool {
        self.shared.listing.lock().unwrap().is_some()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn list_folders(&self) -> Vec<String> {
        self.shared.inventory.lock().unwrap().names()
    }

    /// Folder states for `names` (case-insensitive); all folders when empty.
    pub fn folder_states(&self, names: &[String]) -> BTreeMap<String, SyncState> {
        let inv = self.shared.inventory.lock().unwrap();
        if names.is_empty() {
            return inv.folders().map(|f| (f.name.clone(), f.state)).collect();
        }
        names
            .iter()
            .filter_map(|n| inv.find(n))
            .map(|f| (f.name.clone(), f.state))
            .collect()
    }

    pub fn folder(&self, name: &str) -> Option<FolderEntry> {
        self.shared.inventory.lock().unwrap().find(name).cloned()
    }

    /// Remote paths of the files of `folder`
    pub fn list_files(&self, folder: &str) -> Option<Vec<String>> {
        let inv = self.shared.inventory.lock().unwrap();
        let entry = inv.find(folder)?;
        Some(entry.files().iter().map(|f| f.name.clone()).collect())
    }

    pub fn file_states(&self, folder: &str) -> Option<BTreeMap<String, SyncState>> {
        let inv = self.shared.inventory.lock().unwrap();
        let entry = inv.find(folder)?;
        Some(entry.files().iter().map(|f| (f.name.clone(), f.state)).collect())
    }

    pub fn summary(&self) -> Option<SyncState> {
        self.shared.inventory.lock().unwrap().summary()
    }

    pub fn transfer(&self, uri: &str) -> Option<TransferTask> {
        self.shared.tasks.lock().unwrap().get(uri).cloned()
    }

    /// Tasks currently working, timed out, or queued
    pub fn active_transfers(&self) -> Vec<TransferTask> {
        self.shared
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.state().is_active())
            .cloned()
            .collect()
    }

    /// Poll until no task is active; false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_transfers().is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    /// Wait until a cancelled listing has released its slot.
    async fn wait_listing_done(&self, deadline: Instant) -> bool {
        while self.is_listing() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }

    // ── Downloads ────────────────────────────────────────────────────────────

    /// Download every file of the named folders that is not already synced.
    /// Returns how many transfers were started or re-triggered.
    pub fn download(&self, folders: &[String]) -> usize {
        if self.shared.resetting.load(Ordering::SeqCst) {
            warn!("download ignored during reset");
            return 0;
        }
        let targets: Vec<(String, FileEntry)> = {
            let inv = self.shared.inventory.lock().unwrap();
            folders
                .iter()
                .filter_map(|name| {
                    let found = inv.find(name);
                    if found.is_none() {
                        warn!(folder = %name, "unknown folder");
                    }
                    found
                })
                .flat_map(|folder| {
                    folder
                        .files()
                        .iter()
                        .filter(|f| wants_download(f))
                        .map(|f| (folder.name.clone(), f.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        self.start_all(targets)
    }

    /// Download selected files of one folder, by remote path or file name.
    pub fn download_files(&self, folder: &str, names: &[String]) -> usize {
        if self.shared.resetting.load(Ordering::SeqCst) {
            warn!("download ignored during reset");
            return 0;
        }
        let targets: Vec<(String, FileEntry)> = {
            let inv = self.shared.inventory.lock().unwrap();
            let Some(entry) = inv.find(folder) else {
                warn!(folder, "unknown folder");
                return 0;
            };
            entry
                .files()
                .iter()
                .filter(|f| names.iter().any(|n| *n == f.name || n == f.file_name()))
                .filter(|f| wants_download(f))
                .map(|f| (entry.name.clone(), f.clone()))
                .collect()
        };
        self.start_all(targets)
    }

    fn start_all(&self, targets: Vec<(String, FileEntry)>) -> usize {
        targets
            .into_iter()
            .filter(|(folder, file)| self.shared.start_transfer(folder, file))
            .count()
    }

    /// Stop every task; they keep their place in the task table.
    pub fn stop_all(&self) {
        for task in self.shared.all_tasks() {
            task.stop();
        }
    }

    /// `just_stop`: stop every task. Otherwise also cancel listing, drop
    /// connections, forget the inventory and the tasks, and cancel every
    /// admission lease. True if everything settled.
    pub async fn reset(&self, just_stop: bool) -> bool {
        let shared = &self.shared;
        shared.resetting.store(true, Ordering::SeqCst);
        info!(just_stop, "reset");

        if !just_stop {
            self.stop_listing();
            shared.registry.disconnect_all();
        }
        for task in shared.all_tasks() {
            if just_stop {
                task.stop();
            } else {
                task.stop_and_invalidate();
            }
        }

        let mut settled = true;
        if shared.config.listing.wait_for_all_to_stop {
            let budget = shared.config.download.connect_timeout() + shared.config.download.io_timeout();
            let deadline = Instant::now() + budget;
            settled = self.wait_idle(budget).await;
            if !just_stop {
                settled &= self.wait_listing_done(deadline).await;
            }
            if !settled {
                warn!("transfers or listing still active after reset");
            }
        }

        if !just_stop {
            shared.tasks.lock().unwrap().clear();
            for (_, cleanup) in shared.cleanups.lock().unwrap().drain() {
                cleanup.abort();
            }
            shared.inventory.lock().unwrap().clear();
            shared.admission.cancel_all();
            shared.events.emit(DownloaderEvent::Summary(None));
        }

        shared.resetting.store(false, Ordering::SeqCst);
        settled
    }

    // ── Deletes ──────────────────────────────────────────────────────────────

    /// Delete whole folders on every endpoint reporting them. True only if
    /// every delete succeeded; declined confirmation deletes nothing.
    pub async fn delete_folders(&self, names: &[String], confirm: &dyn DeleteConfirmation) -> bool {
        let targets: Vec<(String, Vec<String>)> = {
            let inv = self.shared.inventory.lock().unwrap();
            names
                .iter()
                .filter_map(|n| inv.find(n))
                .map(|f| (f.name.clone(), f.endpoints.iter().cloned().collect()))
                .collect()
        };
        if targets.is_empty() {
            return true;
        }
        let labels: Vec<String> = targets.iter().map(|(n, _)| n.clone()).collect();
        if !confirm.confirm_remote_delete(&labels) {
            info!(folders = ?labels, "delete declined");
            return false;
        }

        let mut all_ok = true;
        for (folder, endpoints) in targets {
            let mut ok = true;
            for key in &endpoints {
                let Some(endpoint) = self.shared.registry.shared(key) else {
                    ok = false;
                    continue;
                };
                ok &= endpoint.delete_dir_recursive(&folder).await;
            }
            if ok {
                info!(folder = %folder, "deleted remotely");
                self.shared.forget_remote_folder(&folder);
            } else {
                warn!(folder = %folder, "remote delete incomplete");
            }
            all_ok &= ok;
        }
        all_ok
    }

    /// Delete single files (or sub-directories) of a folder on their owning
    /// endpoint.
    pub async fn delete_files(
        &self,
        folder: &str,
        names: &[String],
        confirm: &dyn DeleteConfirmation,
    ) -> bool {
        let (folder_name, targets): (String, Vec<FileEntry>) = {
            let inv = self.shared.inventory.lock().unwrap();
            let Some(entry) = inv.find(folder) else {
                warn!(folder, "unknown folder");
                return false;
            };
            let files = entry
                .files()
                .iter()
                .filter(|f| names.iter().any(|n| *n == f.name || n == f.file_name()))
                .cloned()
                .collect();
            (entry.name.clone(), files)
        };
        if targets.is_empty() {
            return true;
        }
        let labels: Vec<String> = targets.iter().map(|f| f.name.clone()).collect();
        if !confirm.confirm_remote_delete(&labels) {
            info!(files = ?labels, "delete declined");
            return false;
        }

        let mut all_ok = true;
        for file in targets {
            let ok = if file.state == SyncState::Local {
                true
            } else {
                match self.shared.registry.shared(&file.endpoint) {
                    Some(endpoint) if file.is_dir => endpoint.delete_dir_recursive(&file.name).await,
                    Some(endpoint) => endpoint.delete_file(&file.name).await,
                    None => false,
                }
            };
            if ok {
                self.shared.forget_remote_file(&folder_name, &file.name);
            }
            all_ok &= ok;
        }
        all_ok
    }

    // ── Disk space ───────────────────────────────────────────────────────────

    /// Periodically publish free space of the store's volume.
    pub fn spawn_disk_monitor(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let initial = Duration::from_millis(self.shared.config.monitor.disk_space_initial_delay_ms);
        let period = Duration::from_millis(self.shared.config.monitor.disk_space_interval_ms.max(1));
        tokio::spawn(async move {
            tokio::time::sleep(initial).await;
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                match shared.store.disk_space() {
                    Some(space) => shared.events.emit(DownloaderEvent::DiskSpace(space)),
                    None => debug!(root = %shared.store.root().display(), "disk space unavailable"),
                }
            }
        })
    }
}

/// Frees the listing slot however the listing future ends.
struct ListingSlot<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for ListingSlot<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap().take();
    }
}

fn wants_download(file: &FileEntry) -> bool {
    !matches!(file.state, SyncState::Sync | SyncState::Local)
}

impl Shared {
    fn all_tasks(&self) -> Vec<TransferTask> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    /// Start or re-trigger the task for `file`. True if a download was
    /// requested.
    fn start_transfer(self: &Arc<Self>, folder: &str, file: &FileEntry) -> bool {
        // tasks stays locked until the download is requested so a pending
        // cleanup cannot drop the task in between
        let mut tasks = self.tasks.lock().unwrap();
        let task = if let Some(existing) = tasks.get(&file.name) {
            if !existing.state().can_retrigger() {
                debug!(uri = %file.name, state = %existing.state(), "transfer already running or done");
                return false;
            }
            self.cancel_cleanup(&file.name);
            existing.clone()
        } else {
            let Some(endpoint) = self.registry.detached(&file.endpoint) else {
                warn!(uri = %file.name, endpoint = %file.endpoint, "no such endpoint");
                return false;
            };
            let task = TransferTask::new(
                TransferSource::from(file),
                endpoint,
                self.store.clone(),
                self.admission.clone(),
                TransferOptions::from(&self.config.download),
            );
            task.set_listener(self.listener_for(folder, &file.name));
            tasks.insert(file.name.clone(), task.clone());
            task
        };
        task.download();
        true
    }

    fn listener_for(self: &Arc<Self>, folder: &str, uri: &str) -> StateListener {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let folder = folder.to_string();
        let uri = uri.to_string();
        Arc::new(move |old, new| {
            if let Some(shared) = weak.upgrade() {
                shared.on_transfer_state(&folder, &uri, old, new);
            }
        })
    }

    fn on_transfer_state(self: &Arc<Self>, folder: &str, uri: &str, old: TransferState, new: TransferState) {
        self.events.emit(DownloaderEvent::Transfer {
            uri: uri.to_string(),
            old,
            new,
        });

        match new {
            TransferState::Done => self.schedule_cleanup(uri, self.config.download.cleanup_done()),
            TransferState::Working | TransferState::Timeout | TransferState::Queued => {
                self.cancel_cleanup(uri)
            }
            TransferState::Error | TransferState::NotDone | TransferState::Idle => {
                self.schedule_cleanup(uri, self.config.download.cleanup_idle())
            }
        }

        if let Some(state) = new.file_state() {
            self.apply_file_state(folder, uri, state);
        }
    }

    fn apply_file_state(&self, folder: &str, uri: &str, state: SyncState) {
        let mut inv = self.inventory.lock().unwrap();
        let Some(entry) = inv.get_mut(folder) else {
            return;
        };
        let Some(file) = entry.file_mut(uri) else {
            return;
        };
        if file.state == SyncState::Local || file.state == state {
            return;
        }
        file.state = state;
        self.events.emit(DownloaderEvent::FileState {
            folder: folder.to_string(),
            file: uri.to_string(),
            state,
        });
        if entry.refresh_state() {
            self.events.emit(DownloaderEvent::FolderState {
                folder: folder.to_string(),
                state: entry.state,
            });
            let summary = inv.summary();
            self.events.emit(DownloaderEvent::Summary(summary));
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, uri: &str, delay: Duration) {
        let weak = Arc::downgrade(self);
        let key = uri.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.cleanup(&key);
            }
        });
        if let Some(previous) = self.cleanups.lock().unwrap().insert(uri.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_cleanup(&self, uri: &str) {
        if let Some(pending) = self.cleanups.lock().unwrap().remove(uri) {
            pending.abort();
        }
    }

    /// Drop an idle task after its cooldown, unless the cleanup was
    /// cancelled meanwhile.
    fn cleanup(&self, uri: &str) {
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            let pending = self.cleanups.lock().unwrap().remove(uri).is_some();
            let idle = pending && tasks.get(uri).is_some_and(|t| !t.state().is_active());
            if idle {
                tasks.remove(uri)
            } else {
                None
            }
        };
        if let Some(task) = task {
            debug!(uri, state = %task.state(), "dropping idle transfer");
            task.stop_and_invalidate();
        }
    }

    fn drop_task(&self, uri: &str) {
        self.cancel_cleanup(uri);
        let task = self.tasks.lock().unwrap().remove(uri);
        if let Some(task) = task {
            task.stop_and_invalidate();
        }
    }

    /// After a remote folder delete: the folder turns `Local`, its tasks go,
    /// entries without a local copy are pruned.
    fn forget_remote_folder(&self, folder: &str) {
        {
            let mut inv = self.inventory.lock().unwrap();
            let Some(entry) = inv.get_mut(folder) else {
                return;
            };
            entry.mark_local();
            entry.endpoints.clear();
            entry.retain_files(|f| self.store.exists(&f.name));
            if entry.files().is_empty() && !self.store.exists(folder) {
                inv.remove(folder);
            }
        }

        let prefix = format!("{folder}/");
        let doomed: Vec<String> = self
            .tasks
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for uri in doomed {
            self.drop_task(&uri);
        }
        self.events.emit(DownloaderEvent::FolderState {
            folder: folder.to_string(),
            state: SyncState::Local,
        });
    }

    fn forget_remote_file(&self, folder: &str, uri: &str) {
        {
            let mut inv = self.inventory.lock().unwrap();
            let Some(entry) = inv.get_mut(folder) else {
                return;
            };
            if let Some(file) = entry.file_mut(uri) {
                file.state = SyncState::Local;
            }
            if !self.store.exists(uri) {
                entry.remove_file(uri);
            }
            if entry.refresh_state() {
                self.events.emit(DownloaderEvent::FolderState {
                    folder: folder.to_string(),
                    state: entry.state,
                });
            }
        }
        self.drop_task(uri);
        self.events.emit(DownloaderEvent::FileState {
            folder: folder.to_string(),
            file: uri.to_string(),
            state: SyncState::Local,
        });
    }
}
