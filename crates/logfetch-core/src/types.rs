use serde::{Deserialize, Serialize};
use std::fmt;

/// Synchronization state of a remote folder or file against its local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    /// Reported remotely, nothing local yet
    New,
    /// A transfer is queued, running, or waiting to retry
    Downloading,
    /// The last transfer failed
    Error,
    /// Local copy exists but differs from the remote size
    Incomplete,
    /// Local copy size matches the remote size exactly
    Sync,
    /// Not yet determined
    Unknown,
    /// Known only locally, absent from every reachable endpoint
    Local,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::New => "new",
            SyncState::Downloading => "downloading",
            SyncState::Error => "error",
            SyncState::Incomplete => "incomplete",
            SyncState::Sync => "sync",
            SyncState::Unknown => "unknown",
            SyncState::Local => "local",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    Working,
    Done,
    Error,
    NotDone,
    Timeout,
    Queued,
}

impl TransferState {
    /// Working, waiting for a retry, or waiting for admission
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TransferState::Working | TransferState::Timeout | TransferState::Queued
        )
    }

    /// States from which a new download request re-triggers the same task
    pub fn can_retrigger(self) -> bool {
        matches!(
            self,
            TransferState::Error
                | TransferState::Idle
                | TransferState::Timeout
                | TransferState::Queued
                | TransferState::NotDone
        )
    }

    /// File state displayed while a transfer sits in this state.
    /// `Idle` leaves the file state untouched.
    pub fn file_state(self) -> Option<SyncState> {
        match self {
            TransferState::Done => Some(SyncState::Sync),
            TransferState::Error => Some(SyncState::Error),
            TransferState::Working | TransferState::Timeout | TransferState::Queued => {
                Some(SyncState::Downloading)
            }
            TransferState::NotDone => Some(SyncState::Incomplete),
            TransferState::Idle => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::Working => "working",
            TransferState::Done => "done",
            TransferState::Error => "error",
            TransferState::NotDone => "not-done",
            TransferState::Timeout => "timeout",
            TransferState::Queued => "queued",
        };
        f.write_str(s)
    }
}

/// One entry of a single-level remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Last path component, without a trailing slash
    pub name: String,
    /// Full remote path relative to the endpoint root, without a trailing slash
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}
