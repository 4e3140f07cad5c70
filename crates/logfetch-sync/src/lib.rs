//! logfetch-sync: reconciles remote log inventories with the local store and
//! drives admission-controlled, resumable downloads

pub mod admission;
pub mod events;
pub mod inventory;
pub mod orchestrator;
pub mod progress;
pub mod reconcile;
pub mod store;
pub mod transfer;

pub use admission::{AdmissionQueue, Lease};
pub use events::{DownloaderEvent, ListingPhase};
pub use inventory::{derive_state, FileEntry, FolderEntry, Inventory};
pub use orchestrator::{AlwaysConfirm, DeleteConfirmation, DownloadOrchestrator};
pub use transfer::{TransferOptions, TransferProgress, TransferTask};
