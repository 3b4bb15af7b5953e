//! todoist-sync-daemon library: native adapters for the sync core.
//!
//! The binary is a thin CLI over these; integration tests use them directly.

pub mod config;
pub mod native_fs;
pub mod notifier;
pub mod persistence;
pub mod scheduler;
pub mod todoist;

pub use config::{ConfigError, DaemonConfig};
pub use native_fs::VaultNoteStore;
pub use notifier::TracingNotifier;
pub use persistence::FileJournalBackend;
pub use scheduler::TokioScheduler;
pub use todoist::TodoistClient;

use std::sync::Arc;
use todoist_sync_core::{
    RemoteTaskStore, SyncCoordinator, SyncJournalStore, SyncSettings, SystemClock, UserNotifier,
};

/// Wire a coordinator over the vault and data directory in `config`.
pub fn build_coordinator(
    config: &DaemonConfig,
    settings: SyncSettings,
    remote: Arc<dyn RemoteTaskStore>,
    notifier: Arc<dyn UserNotifier>,
) -> SyncCoordinator {
    let clock = Arc::new(SystemClock);
    let backend = Arc::new(FileJournalBackend::new(&config.data_dir));
    let journal = SyncJournalStore::new(backend, clock.clone());
    let local = Arc::new(VaultNoteStore::new(config.vault_path.clone()));
    SyncCoordinator::new(journal, local, remote, notifier, clock, settings)
}
