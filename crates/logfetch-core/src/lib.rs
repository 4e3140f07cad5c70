pub mod config;
pub mod error;
pub mod types;

pub use error::{LogFetchError, LogFetchResult};
pub use types::{RemoteEntry, SyncState, TransferState};
