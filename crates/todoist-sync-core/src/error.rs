use crate::fs::LocalStoreError;
use crate::remote::RemoteError;
use crate::store::JournalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Note store error: {0}")]
    Local(#[from] LocalStoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("No linked task {remote_id} at {path}:{line_index}")]
    TaskNotFound {
        remote_id: String,
        path: String,
        line_index: usize,
    },

    #[error("Task {0} is tombstoned")]
    Tombstoned(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
