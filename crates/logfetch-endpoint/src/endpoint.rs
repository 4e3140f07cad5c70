//! One connection handle to a remote log server.
//!
//! An `Endpoint` owns at most one live OpenDAL operator. The operator is built
//! lazily on first use, proven reachable with a root listing, and dropped on
//! `disconnect`. Every remote call is bounded by a timeout; an elapsed timeout
//! surfaces as `LogFetchError::Timeout` so callers can tell retryable stalls
//! apart from hard failures.

use bytes::Bytes;
use logfetch_core::config::DownloadConfig;
use logfetch_core::{LogFetchError, LogFetchResult, RemoteEntry};
use opendal::Operator;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::delete::{delete_tree, RemoteTree};
use crate::operator::{EndpointAddr, OperatorFactory};
use crate::reachability::check_reachable;

/// Time budgets for remote calls
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub io: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            io: Duration::from_secs(30),
        }
    }
}

impl From<&DownloadConfig> for Timeouts {
    fn from(cfg: &DownloadConfig) -> Self {
        Self {
            connect: cfg.connect_timeout(),
            io: cfg.io_timeout(),
        }
    }
}

pub struct Endpoint {
    addr: EndpointAddr,
    factory: Arc<dyn OperatorFactory>,
    timeouts: Timeouts,
    op: RwLock<Option<Operator>>,
    reachable: AtomicBool,
}

impl Endpoint {
    pub fn new(addr: EndpointAddr, factory: Arc<dyn OperatorFactory>, timeouts: Timeouts) -> Self {
        Self {
            addr,
            factory,
            timeouts,
            op: RwLock::new(None),
            reachable: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.addr.key
    }

    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    /// Build a fresh operator and prove the server answers.
    pub async fn connect(&self) -> LogFetchResult<()> {
        let op = self
            .factory
            .build(&self.addr)
            .map_err(|e| self.connection_error(format!("{e:#}")))?;

        match tokio::time::timeout(self.timeouts.connect, check_reachable(&op, &self.addr)).await {
            Err(_) => {
                self.reachable.store(false, Ordering::SeqCst);
                Err(self.timeout_error("connect"))
            }
            Ok(Err(e)) => {
                self.reachable.store(false, Ordering::SeqCst);
                Err(e)
            }
            Ok(Ok(())) => {
                *self.op.write().unwrap() = Some(op);
                self.reachable.store(true, Ordering::SeqCst);
                debug!(endpoint = %self.addr, "connected");
                Ok(())
            }
        }
    }

    /// Drop the current connection and establish a new one.
    pub async fn renew(&self) -> LogFetchResult<()> {
        self.disconnect();
        self.connect().await
    }

    /// True while a connection is held and the last remote contact succeeded
    pub fn is_connected(&self) -> bool {
        self.op.read().unwrap().is_some() && self.reachable.load(Ordering::SeqCst)
    }

    pub fn disconnect(&self) {
        let had = self.op.write().unwrap().take().is_some();
        self.reachable.store(false, Ordering::SeqCst);
        if had {
            debug!(endpoint = %self.addr, "disconnected");
        }
    }

    /// Top-level remote folders.
    pub async fn list_base_entries(&self) -> LogFetchResult<Vec<RemoteEntry>> {
        let entries = self.list_directory("").await?;
        Ok(entries.into_iter().filter(|e| e.is_dir).collect())
    }

    /// One level of a remote directory. `path` is relative to the endpoint
    /// root; an empty path lists the root.
    pub async fn list_directory(&self, path: &str) -> LogFetchResult<Vec<RemoteEntry>> {
        let trimmed = path.trim_matches('/');
        let dir = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("{trimmed}/")
        };

        let listed = self
            .call("list", &dir, |op| {
                let dir = dir.clone();
                async move { op.list(&dir).await }
            })
            .await?;

        let mut out = Vec::with_capacity(listed.len());
        for entry in listed {
            let name = entry.name().trim_end_matches('/');
            // opendal includes the listed directory itself
            if name.is_empty() || entry.path() == dir || entry.path().trim_end_matches('/') == trimmed
            {
                continue;
            }
            let child = if trimmed.is_empty() {
                name.to_string()
            } else {
                format!("{trimmed}/{name}")
            };
            let is_dir = entry.metadata().is_dir();
            let mut size = if is_dir { 0 } else { entry.metadata().content_length() };
            if !is_dir && size == 0 {
                // some listings omit sizes
                size = stat_or_listed(&child, size, self.stat_size(&child).await);
            }
            out.push(RemoteEntry {
                name: name.to_string(),
                path: child,
                size,
                is_dir,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn stat_size(&self, path: &str) -> LogFetchResult<u64> {
        let meta = self
            .call("stat", path, |op| {
                let path = path.to_string();
                async move { op.stat(&path).await }
            })
            .await?;
        Ok(meta.content_length())
    }

    /// Open `path` for reading from `offset` up to `end` (exclusive).
    pub async fn open_read(
        &self,
        path: &str,
        offset: u64,
        end: u64,
        chunk_size: usize,
    ) -> LogFetchResult<RemoteReader> {
        let reader = self
            .call("open", path, |op| {
                let path = path.to_string();
                async move { op.reader(&path).await }
            })
            .await?;

        Ok(RemoteReader {
            reader,
            endpoint: self.addr.key.clone(),
            path: path.to_string(),
            pos: offset,
            end,
            chunk: chunk_size.max(1) as u64,
            io_timeout: self.timeouts.io,
        })
    }

    pub async fn delete_file(&self, path: &str) -> bool {
        let result = self
            .call("delete", path, |op| {
                let path = path.trim_matches('/').to_string();
                async move { op.delete(&path).await }
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %self.addr, path, error = %e, "remote file delete failed");
                false
            }
        }
    }

    /// Remove an empty remote directory node.
    pub async fn delete_dir(&self, path: &str) -> bool {
        let dir = format!("{}/", path.trim_matches('/'));
        let result = self
            .call("rmdir", &dir, |op| {
                let dir = dir.clone();
                async move { op.delete(&dir).await }
            })
            .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(endpoint = %self.addr, path, error = %e, "remote directory delete failed");
                false
            }
        }
    }

    /// Delete every file below `path`, then the directories bottom-up.
    /// Best effort: returns false if anything could not be removed.
    pub async fn delete_dir_recursive(&self, path: &str) -> bool {
        delete_tree(self, path).await
    }

    async fn call<T, F, Fut>(&self, operation: &str, path: &str, f: F) -> LogFetchResult<T>
    where
        F: FnOnce(Operator) -> Fut,
        Fut: Future<Output = opendal::Result<T>>,
    {
        let op = self.operator().await?;
        match tokio::time::timeout(self.timeouts.io, f(op)).await {
            Err(_) => {
                self.reachable.store(false, Ordering::SeqCst);
                Err(self.timeout_error(operation))
            }
            Ok(Err(e)) => Err(self.classify(path, e)),
            Ok(Ok(value)) => {
                self.reachable.store(true, Ordering::SeqCst);
                Ok(value)
            }
        }
    }

    async fn operator(&self) -> LogFetchResult<Operator> {
        let cached = self.op.read().unwrap().clone();
        if let Some(op) = cached {
            return Ok(op);
        }
        self.connect().await?;
        let connected = self.op.read().unwrap().clone();
        connected.ok_or_else(|| self.connection_error("connection dropped".to_string()))
    }

    fn classify(&self, path: &str, e: opendal::Error) -> LogFetchError {
        if e.is_temporary() {
            self.reachable.store(false, Ordering::SeqCst);
            self.connection_error(e.to_string())
        } else {
            self.reachable.store(true, Ordering::SeqCst);
            LogFetchError::Transfer {
                path: path.to_string(),
                reason: e.to_string(),
            }
        }
    }

    fn connection_error(&self, reason: String) -> LogFetchError {
        LogFetchError::Connection {
            endpoint: self.addr.to_string(),
            reason,
        }
    }

    fn timeout_error(&self, operation: &str) -> LogFetchError {
        LogFetchError::Timeout {
            endpoint: self.addr.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Size of a file whose listing reported zero: the stat result, or the listed
/// size when the stat fails. One bad entry never fails the whole listing.
fn stat_or_listed(path: &str, listed: u64, stat: LogFetchResult<u64>) -> u64 {
    match stat {
        Ok(size) => size,
        Err(e) => {
            debug!(path, error = %e, "stat failed, keeping listed size");
            listed
        }
    }
}

impl RemoteTree for Endpoint {
    async fn children(&self, dir: &str) -> LogFetchResult<Vec<RemoteEntry>> {
        self.list_directory(dir).await
    }

    async fn remove_file(&self, path: &str) -> bool {
        self.delete_file(path).await
    }

    async fn remove_dir(&self, path: &str) -> bool {
        self.delete_dir(path).await
    }
}

/// Sequential ranged reader over one remote file
pub struct RemoteReader {
    reader: opendal::Reader,
    endpoint: String,
    path: String,
    pos: u64,
    end: u64,
    chunk: u64,
    io_timeout: Duration,
}

impl RemoteReader {
    /// Next chunk, or `None` once `end` is reached or the remote runs dry.
    pub async fn next_chunk(&mut self) -> LogFetchResult<Option<Bytes>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let upto = (self.pos + self.chunk).min(self.end);
        let buf = match tokio::time::timeout(self.io_timeout, self.reader.read(self.pos..upto)).await
        {
            Err(_) => {
                return Err(LogFetchError::Timeout {
                    endpoint: self.endpoint.clone(),
                    operation: "read".into(),
                })
            }
            Ok(Err(e)) if e.is_temporary() => {
                return Err(LogFetchError::Connection {
                    endpoint: self.endpoint.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Err(e)) => {
                return Err(LogFetchError::Transfer {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(buf)) => buf.to_bytes(),
        };
        if buf.is_empty() {
            return Ok(None);
        }
        self.pos += buf.len() as u64;
        Ok(Some(buf))
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
