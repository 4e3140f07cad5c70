//! Outbound notifications. Presentation layers subscribe; the engine never
//! waits on them.

use logfetch_core::{SyncState, TransferState};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

use crate::store::DiskSpace;

/// Progress of one listing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ListingPhase {
    Starting,
    Connecting,
    Filtering,
    Processing {
        folder: String,
        index: usize,
        total: usize,
    },
    Updating {
        folder: String,
    },
    Done,
    Cancelled,
}

impl fmt::Display for ListingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListingPhase::Starting => f.write_str("starting"),
            ListingPhase::Connecting => f.write_str("connecting"),
            ListingPhase::Filtering => f.write_str("filtering"),
            ListingPhase::Processing {
                folder,
                index,
                total,
            } => write!(f, "processing {folder} ({index}/{total})"),
            ListingPhase::Updating { folder } => write!(f, "updating {folder}"),
            ListingPhase::Done => f.write_str("done"),
            ListingPhase::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum DownloaderEvent {
    Listing(ListingPhase),
    FolderState {
        folder: String,
        state: SyncState,
    },
    FileState {
        folder: String,
        file: String,
        state: SyncState,
    },
    /// Representative state over all folders; `None` when nothing is known
    Summary(Option<SyncState>),
    Transfer {
        uri: String,
        old: TransferState,
        new: TransferState,
    },
    DiskSpace(DiskSpace),
    /// A remote directory nested deeper than the supported depth was skipped
    DepthLimited {
        endpoint: String,
        path: String,
    },
    /// Transient user-facing message
    Message(String),
}

/// Broadcast fan-out of `DownloaderEvent`s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloaderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloaderEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DownloaderEvent) {
        trace!(?event, "event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
