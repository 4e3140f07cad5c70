//! Per-file and per-directory download state machine.
//!
//! ```text
//! Idle --(download, admission granted)--> Working
//! Working --> Done | NotDone | Error | Timeout
//! Timeout --(retry after delay, if still Timeout)--> Working
//! Done|Error|NotDone|Timeout --(download)--> Working (Queued under admission control)
//! Queued --(admission granted)--> Working
//! any --(stop)--> NotDone (Done stays Done)
//! ```
//!
//! Transport and disk failures never leave the task: they become states. Each
//! attempt owns a cancellation token and a generation number; a stop cancels
//! the token and bumps the generation, so a late-finishing attempt cannot
//! overwrite the stopped state.

use logfetch_core::config::DownloadConfig;
use logfetch_core::{LogFetchError, LogFetchResult, TransferState};
use logfetch_endpoint::Endpoint;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionQueue, Lease};
use crate::inventory::FileEntry;
use crate::progress::{Eta, ThroughputMeter};
use crate::store::LocalStore;

/// Called with `(old, new)` on every state change of a task
pub type StateListener = Arc<dyn Fn(TransferState, TransferState) + Send + Sync>;

const FILE_TICK: Duration = Duration::from_millis(150);
const DIR_TICK: Duration = Duration::from_millis(100);

// ── Options and inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub admission_control: bool,
    pub resume: bool,
    pub retry_delay: Duration,
    pub chunk_size: usize,
    pub progress_window: usize,
    pub max_eta: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from(&DownloadConfig::default())
    }
}

impl From<&DownloadConfig> for TransferOptions {
    fn from(cfg: &DownloadConfig) -> Self {
        Self {
            admission_control: cfg.admission_control,
            resume: cfg.resume,
            retry_delay: cfg.retry_delay(),
            chunk_size: cfg.chunk_size,
            progress_window: cfg.progress_window,
            max_eta: cfg.max_eta(),
        }
    }
}

/// What a task fetches: one file, or a directory with a pre-enumerated
/// child list
#[derive(Debug, Clone)]
pub struct TransferSource {
    pub uri: String,
    pub size: u64,
    pub is_dir: bool,
    pub children: Vec<TransferSource>,
}

impl From<&FileEntry> for TransferSource {
    fn from(entry: &FileEntry) -> Self {
        Self {
            uri: entry.name.clone(),
            size: entry.size.unwrap_or(0),
            is_dir: entry.is_dir,
            children: entry.children.iter().map(TransferSource::from).collect(),
        }
    }
}

/// Snapshot published while a task works
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferProgress {
    /// Bytes present locally, including any resumed prefix
    pub downloaded: u64,
    pub total: u64,
    /// Offset the current attempt resumed from
    pub resumed_from: u64,
    pub rate_bps: Option<f64>,
    pub eta: Option<Eta>,
    pub done_files: usize,
    pub total_files: usize,
}

enum Outcome {
    Complete,
    Partial,
    Stopped,
    Failed(LogFetchError),
}

// ── Task ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TransferTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    source: TransferSource,
    endpoint: Endpoint,
    store: LocalStore,
    admission: Arc<AdmissionQueue<String>>,
    options: TransferOptions,
    /// Serializes transitions together with their listener call
    serial: Mutex<()>,
    state: Mutex<TransferState>,
    attempt: AtomicU64,
    cancel: Mutex<CancellationToken>,
    listener: Mutex<Option<StateListener>>,
    invalidated: AtomicBool,
    retry: Mutex<Option<JoinHandle<()>>>,
    downloaded: AtomicU64,
    resumed_from: AtomicU64,
    done_files: AtomicUsize,
    progress: watch::Sender<TransferProgress>,
}

impl TransferTask {
    /// `endpoint` must be a connection owned by this task alone.
    pub fn new(
        source: TransferSource,
        endpoint: Endpoint,
        store: LocalStore,
        admission: Arc<AdmissionQueue<String>>,
        options: TransferOptions,
    ) -> Self {
        let (progress, _) = watch::channel(TransferProgress::default());
        Self {
            inner: Arc::new(TaskInner {
                source,
                endpoint,
                store,
                admission,
                options,
                serial: Mutex::new(()),
                state: Mutex::new(TransferState::Idle),
                attempt: AtomicU64::new(0),
                cancel: Mutex::new(CancellationToken::new()),
                listener: Mutex::new(None),
                invalidated: AtomicBool::new(false),
                retry: Mutex::new(None),
                downloaded: AtomicU64::new(0),
                resumed_from: AtomicU64::new(0),
                done_files: AtomicUsize::new(0),
                progress,
            }),
        }
    }

    /// Remote path; unique per task
    pub fn id(&self) -> &str {
        &self.inner.source.uri
    }

    pub fn source(&self) -> &TransferSource {
        &self.inner.source
    }

    pub fn state(&self) -> TransferState {
        self.inner.state()
    }

    pub fn set_listener(&self, listener: StateListener) {
        *self.inner.listener.lock().unwrap() = Some(listener);
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> TransferProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<TransferProgress> {
        self.inner.progress.subscribe()
    }

    /// Request a download. Returns immediately; the work runs on the tokio
    /// runtime. Ignored while working, while already waiting for admission,
    /// and after invalidation.
    pub fn download(&self) {
        self.inner.start();
    }

    /// Stop the current attempt, drop the connection, and give up admission.
    /// Anything but `Done` becomes `NotDone`.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Detach the listener, stop, and refuse further downloads.
    pub fn stop_and_invalidate(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
        *self.inner.listener.lock().unwrap() = None;
        self.inner.stop();
    }
}

impl TaskInner {
    fn state(&self) -> TransferState {
        *self.state.lock().unwrap()
    }

    fn uri(&self) -> &str {
        &self.source.uri
    }

    fn start(self: &Arc<Self>) {
        if self.invalidated.load(Ordering::SeqCst) {
            debug!(uri = %self.uri(), "download ignored: task invalidated");
            return;
        }
        match self.state() {
            TransferState::Working => return,
            TransferState::Queued
                if self.admission.is_queued(&self.source.uri)
                    || self.admission.is_leased(&self.source.uri) =>
            {
                return
            }
            _ => {}
        }

        if self.options.admission_control {
            self.ask_for_lease();
        } else {
            let this = self.clone();
            tokio::spawn(async move { this.run_worker(None).await });
        }
    }

    fn ask_for_lease(self: &Arc<Self>) {
        // a lease still held under this key belongs to an attempt that has
        // already finished
        self.admission.release(&self.source.uri);
        self.set_state(TransferState::Queued);
        let this = self.clone();
        tokio::spawn(async move {
            let Some(lease) = this.admission.lease_and_wait(this.source.uri.clone()).await else {
                debug!(uri = %this.uri(), "admission request dropped");
                return;
            };
            if this.state() == TransferState::Queued {
                this.run_worker(Some(lease)).await;
            }
        });
    }

    async fn run_worker(self: Arc<Self>, lease: Option<Lease<String>>) {
        let Some((prev, token, attempt)) = self.begin_attempt() else {
            return;
        };
        let _lease = lease;

        let ticker = self.spawn_ticker(token.clone());
        let outcome = self.attempt_transfer(prev, &token).await;
        ticker.abort();

        self.end_attempt(attempt, outcome);
    }

    /// Settle `attempt` and drop its connection. A superseded attempt leaves
    /// the connection to whoever took over.
    fn end_attempt(self: &Arc<Self>, attempt: u64, outcome: Outcome) {
        self.finish_attempt(attempt, outcome);
        self.publish_progress(None);
        if self.attempt.load(Ordering::SeqCst) == attempt {
            self.endpoint.disconnect();
        }
    }

    fn begin_attempt(&self) -> Option<(TransferState, CancellationToken, u64)> {
        let _serial = self.serial.lock().unwrap();
        let (prev, token, attempt) = {
            let mut state = self.state.lock().unwrap();
            if *state == TransferState::Working {
                return None;
            }
            let prev = std::mem::replace(&mut *state, TransferState::Working);
            let token = CancellationToken::new();
            *self.cancel.lock().unwrap() = token.clone();
            let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
            (prev, token, attempt)
        };
        self.notify(prev, TransferState::Working);
        Some((prev, token, attempt))
    }

    fn finish_attempt(self: &Arc<Self>, attempt: u64, outcome: Outcome) {
        let next = match &outcome {
            Outcome::Complete => TransferState::Done,
            Outcome::Partial | Outcome::Stopped => TransferState::NotDone,
            Outcome::Failed(e) if e.is_timeout() => TransferState::Timeout,
            Outcome::Failed(_) => TransferState::Error,
        };

        let old = {
            let _serial = self.serial.lock().unwrap();
            let old = {
                let mut state = self.state.lock().unwrap();
                if self.attempt.load(Ordering::SeqCst) != attempt
                    || *state != TransferState::Working
                {
                    debug!(uri = %self.uri(), "stale attempt finished");
                    return;
                }
                std::mem::replace(&mut *state, next)
            };
            self.notify(old, next);
            old
        };

        let uri = self.uri();
        let bytes = self.downloaded.load(Ordering::SeqCst);
        match outcome {
            Outcome::Complete => info!(uri = %uri, bytes, "downloaded"),
            Outcome::Partial => warn!(uri = %uri, bytes, expected = self.source.size, "transfer incomplete"),
            Outcome::Stopped => debug!(uri = %uri, bytes, "transfer stopped"),
            Outcome::Failed(ref e) if e.is_timeout() => {
                warn!(uri = %uri, error = %e, retry_in = ?self.options.retry_delay, "transfer timed out");
            }
            Outcome::Failed(ref e) => warn!(uri = %uri, error = %e, "transfer failed"),
        }

        if next == TransferState::Timeout && old == TransferState::Working {
            self.schedule_retry();
        }
    }

    fn stop(&self) {
        {
            let _serial = self.serial.lock().unwrap();
            let (old, new) = {
                let mut state = self.state.lock().unwrap();
                self.attempt.fetch_add(1, Ordering::SeqCst);
                self.cancel.lock().unwrap().cancel();
                let old = *state;
                if old != TransferState::Done {
                    *state = TransferState::NotDone;
                }
                (old, *state)
            };
            self.notify(old, new);
        }
        if let Some(retry) = self.retry.lock().unwrap().take() {
            retry.abort();
        }
        self.endpoint.disconnect();
        self.admission.release(&self.source.uri);
        debug!(uri = %self.uri(), "stopped");
    }

    fn set_state(&self, next: TransferState) {
        let _serial = self.serial.lock().unwrap();
        let old = std::mem::replace(&mut *self.state.lock().unwrap(), next);
        self.notify(old, next);
    }

    /// Caller holds `serial`.
    fn notify(&self, old: TransferState, new: TransferState) {
        if old == new {
            return;
        }
        debug!(uri = %self.uri(), %old, %new, "transfer state");
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener(old, new);
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        let this = self.clone();
        let delay = self.options.retry_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.state() == TransferState::Timeout {
                info!(uri = %this.uri(), "retrying after timeout");
                this.start();
            }
        });
        if let Some(previous) = self.retry.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    // ── Byte movement ────────────────────────────────────────────────────────

    async fn attempt_transfer(&self, prev: TransferState, token: &CancellationToken) -> Outcome {
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Stopped,
            r = self.endpoint.renew() => r,
        };
        if let Err(e) = connected {
            return Outcome::Failed(e);
        }

        if self.source.is_dir {
            self.transfer_directory(token).await
        } else {
            self.transfer_file(prev, token).await
        }
    }

    async fn transfer_file(&self, prev: TransferState, token: &CancellationToken) -> Outcome {
        let size = self.source.size;
        let target = self.store.target(self.uri());

        let mut begin = 0;
        if self.options.resume && prev != TransferState::Done {
            if let Ok(meta) = tokio::fs::metadata(&target).await {
                if meta.is_file() {
                    begin = meta.len();
                    if begin > size {
                        begin = 0;
                    }
                }
            }
        }
        self.reset_progress(begin, 1);
        if begin > 0 {
            debug!(uri = %self.uri(), offset = begin, "resuming");
        }

        match self.copy_range(self.uri(), &target, begin, size, token).await {
            Ok(Some(len)) if len == size => Outcome::Complete,
            Ok(Some(_)) => Outcome::Partial,
            Ok(None) => Outcome::Stopped,
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn transfer_directory(&self, token: &CancellationToken) -> Outcome {
        let children = &self.source.children;
        self.reset_progress(0, children.len());
        let mut done = 0usize;

        for child in children {
            if token.is_cancelled() {
                return Outcome::Stopped;
            }
            let target = self.store.target(&child.uri);
            let local = tokio::fs::metadata(&target).await.ok().filter(|m| m.is_file());
            if local.map(|m| m.len()) == Some(child.size) {
                done += 1;
                self.downloaded.fetch_add(child.size, Ordering::SeqCst);
                self.done_files.store(done, Ordering::SeqCst);
                continue;
            }

            match self.copy_range(&child.uri, &target, 0, child.size, token).await {
                Ok(Some(len)) if len == child.size => {
                    done += 1;
                    self.done_files.store(done, Ordering::SeqCst);
                }
                Ok(Some(len)) => {
                    warn!(uri = %child.uri, bytes = len, expected = child.size, "short read");
                }
                Ok(None) => return Outcome::Stopped,
                Err(e) if e.is_timeout() || e.is_connection() => return Outcome::Failed(e),
                Err(e) => warn!(uri = %child.uri, error = %e, "skipping child"),
            }
        }

        if done == children.len() {
            Outcome::Complete
        } else {
            Outcome::Partial
        }
    }

    /// Copy `uri[begin..end]` into `target`, appending when `begin > 0`.
    /// Returns the local file length, or `None` if stopped.
    async fn copy_range(
        &self,
        uri: &str,
        target: &Path,
        begin: u64,
        end: u64,
        token: &CancellationToken,
    ) -> LogFetchResult<Option<u64>> {
        let mut reader = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            r = self.endpoint.open_read(uri, begin, end, self.options.chunk_size) => r?,
        };

        // first chunk before touching the disk
        let mut pending = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            c = reader.next_chunk() => c?,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if begin > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(target)
                .await?
        } else {
            tokio::fs::File::create(target).await?
        };

        let mut written = begin;
        while let Some(chunk) = pending.take() {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.downloaded
                .fetch_add(chunk.len() as u64, Ordering::SeqCst);

            pending = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Ok(None);
                }
                c = reader.next_chunk() => c?,
            };
        }
        file.flush().await?;
        Ok(Some(written))
    }

    // ── Progress ─────────────────────────────────────────────────────────────

    fn reset_progress(&self, resumed_from: u64, total_files: usize) {
        self.downloaded.store(resumed_from, Ordering::SeqCst);
        self.resumed_from.store(resumed_from, Ordering::SeqCst);
        self.done_files.store(0, Ordering::SeqCst);
        self.progress.send_modify(|p| {
            p.total_files = total_files;
            p.total = self.source.size;
        });
        self.publish_progress(None);
    }

    fn spawn_ticker(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        let period = if self.source.is_dir { DIR_TICK } else { FILE_TICK };
        tokio::spawn(async move {
            let mut meter = ThroughputMeter::new(this.options.progress_window);
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if this.state() != TransferState::Working {
                    break;
                }
                this.publish_progress(Some(&mut meter));
            }
        })
    }

    fn publish_progress(&self, meter: Option<&mut ThroughputMeter>) {
        let downloaded = self.downloaded.load(Ordering::SeqCst);
        let total = self.source.size;
        let rate_bps = match meter {
            Some(m) => m.sample(downloaded, Instant::now()),
            None => self.progress.borrow().rate_bps,
        };
        let eta = rate_bps
            .and_then(|r| Eta::estimate(total.saturating_sub(downloaded), r, self.options.max_eta));
        let done_files = self.done_files.load(Ordering::SeqCst);
        let resumed_from = self.resumed_from.load(Ordering::SeqCst);
        self.progress.send_modify(|p| {
            p.downloaded = downloaded;
            p.total = total;
            p.resumed_from = resumed_from;
            p.rate_bps = rate_bps;
            p.eta = eta;
            p.done_files = done_files;
        });
    }
}
