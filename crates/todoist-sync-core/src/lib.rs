//! todoist-sync-core: journal-based task-completion sync between a note vault and Todoist.
//!
//! This crate provides the core functionality for:
//! - Recognizing checkbox task lines and their Todoist links
//! - Persisting every linked task's last-known state in a sync journal
//! - Detecting changes on either side with a five-category check policy
//! - Executing and retrying the operations that reconcile both sides
//! - LocalNoteStore, RemoteTaskStore and Scheduler trait abstractions

pub mod clock;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod fs;
pub mod hash;
pub mod journal;
pub mod locator;
pub mod markdown;
pub mod notifier;
pub mod policy;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{InitReport, OperationOutcome, SyncCoordinator, SyncReport};
pub use detector::{ChangeDetector, ChangeSet, CompletenessReport, HealReport};
pub use error::SyncError;
pub use fs::{InMemoryNoteStore, LocalNoteStore, LocalStoreError, NoteFile};
pub use hash::ContentHash;
pub use journal::{
    DeletedTaskLink, DeletionReason, SyncDirection, SyncJournal, SyncOperation, SyncStats, TaskLink,
};
pub use notifier::{NullNotifier, RecordingNotifier, SyncPhase, UserNotifier};
pub use remote::{InMemoryRemoteStore, RemoteError, RemoteTask, RemoteTaskStore, TaskUpdate};
pub use scheduler::{CancelHandle, ManualScheduler, Scheduler, Tick};
pub use service::SyncService;
pub use settings::{SyncSettings, TimestampSource};
pub use store::{InMemoryJournalBackend, JournalBackend, JournalError, SyncJournalStore};
