//! SyncJournalStore: single owner of the in-memory journal and its persistence.
//!
//! All journal mutation goes through this type so the persisted document and
//! the in-memory state never diverge. Persistence goes through a
//! [`JournalBackend`]; the daemon provides a file-backed one with atomic
//! writes, tests use [`InMemoryJournalBackend`].
//!
//! Auto-save is on by default: every mutator persists immediately. Bulk work
//! (a sync cycle, a healing pass) suspends it with `set_auto_save(false)` and
//! ends with `force_save_if_dirty()` so N mutations cost one write.

use crate::clock::Clock;
use crate::journal::{
    DeletedTaskLink, DeletionReason, JOURNAL_VERSION, OperationStatus, StatsUpdate, SyncDirection,
    SyncJournal, SyncOperation, SyncStats, TaskLink, TaskLinkUpdate,
};
use crate::policy;
use crate::settings::SyncSettings;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal storage error: {0}")]
    Io(String),

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task {0} is tombstoned and cannot be tracked again")]
    Tombstoned(String),

    #[error("Task {0} is not tracked")]
    NotTracked(String),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Where the journal document lives.
#[async_trait]
pub trait JournalBackend: Send + Sync {
    /// Read the stored document. `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<String>>;

    /// Replace the stored document. Must never leave a half-written document.
    async fn save(&self, contents: &str) -> Result<()>;

    /// Store a labelled snapshot next to the journal. Returns its name.
    async fn backup(&self, label: &str, contents: &str) -> Result<String>;
}

/// Journal backend held in memory, for tests.
#[derive(Default)]
pub struct InMemoryJournalBackend {
    contents: Mutex<Option<String>>,
    backups: Mutex<Vec<(String, String)>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl InMemoryJournalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend pre-loaded with a stored document.
    pub fn with_contents(contents: &str) -> Self {
        let backend = Self::default();
        *backend.contents.lock().unwrap() = Some(contents.to_string());
        backend
    }

    pub fn contents(&self) -> Option<String> {
        self.contents.lock().unwrap().clone()
    }

    pub fn backups(&self) -> Vec<(String, String)> {
        self.backups.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail, to exercise save-failure handling.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JournalBackend for InMemoryJournalBackend {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.contents.lock().unwrap().clone())
    }

    async fn save(&self, contents: &str) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(JournalError::Io("simulated save failure".into()));
        }
        *self.contents.lock().unwrap() = Some(contents.to_string());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn backup(&self, label: &str, contents: &str) -> Result<String> {
        let mut backups = self.backups.lock().unwrap();
        let name = format!("{}-{}", label, backups.len());
        backups.push((name.clone(), contents.to_string()));
        Ok(name)
    }
}

pub struct SyncJournalStore {
    backend: Arc<dyn JournalBackend>,
    clock: Arc<dyn Clock>,
    journal: SyncJournal,
    dirty: bool,
    auto_save: bool,
}

impl SyncJournalStore {
    /// Create a store holding an empty journal. Call [`load`](Self::load) to
    /// read the persisted one.
    pub fn new(backend: Arc<dyn JournalBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            journal: SyncJournal::default(),
            dirty: false,
            auto_save: true,
        }
    }

    /// Load the journal from the backend.
    ///
    /// Never fails: an unreadable or corrupt document is logged, preserved as a
    /// `corrupt` backup when possible, and replaced by an empty journal.
    pub async fn load(&mut self) {
        self.journal = match self.backend.load().await {
            Ok(None) => {
                info!("No sync journal found, starting with an empty journal");
                SyncJournal::default()
            }
            Ok(Some(contents)) => match serde_json::from_str::<SyncJournal>(&contents) {
                Ok(journal) => journal,
                Err(e) => {
                    warn!("Sync journal is corrupt ({}), starting over", e);
                    if let Err(e) = self.backend.backup("corrupt", &contents).await {
                        warn!("Failed to preserve corrupt journal: {}", e);
                    }
                    SyncJournal::default()
                }
            },
            Err(e) => {
                warn!("Failed to read sync journal ({}), starting over", e);
                SyncJournal::default()
            }
        };

        // A tombstoned id must not also be live
        let SyncJournal {
            tasks,
            deleted_tasks,
            ..
        } = &mut self.journal;
        tasks.retain(|id, _| {
            let keep = !deleted_tasks.contains_key(id);
            if !keep {
                warn!("Dropping live entry for tombstoned task {}", id);
            }
            keep
        });

        self.dirty = false;
        info!(
            "Loaded sync journal: {} tasks, {} tombstones, {} pending, {} failed",
            self.journal.tasks.len(),
            self.journal.deleted_tasks.len(),
            self.journal.pending_operations.len(),
            self.journal.failed_operations.len()
        );
    }

    /// Persist the journal now.
    pub async fn save(&mut self) -> Result<()> {
        self.journal.version = JOURNAL_VERSION.to_string();
        let contents = serde_json::to_string_pretty(&self.journal)?;
        self.backend.save(&contents).await?;
        self.dirty = false;
        debug!("Saved sync journal ({} tasks)", self.journal.tasks.len());
        Ok(())
    }

    pub async fn force_save_if_dirty(&mut self) -> Result<()> {
        if self.dirty {
            self.save().await
        } else {
            Ok(())
        }
    }

    pub fn set_auto_save(&mut self, enabled: bool) {
        self.auto_save = enabled;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark dirty and persist if auto-save is on. Save failures are logged and
    /// leave the in-memory journal authoritative.
    async fn touch(&mut self) {
        self.dirty = true;
        if self.auto_save {
            if let Err(e) = self.save().await {
                error!("Failed to save sync journal: {}", e);
            }
        }
    }

    // ==================== Tasks ====================

    pub async fn add_task(&mut self, link: TaskLink) -> Result<()> {
        if self.journal.deleted_tasks.contains_key(&link.remote_id) {
            return Err(JournalError::Tombstoned(link.remote_id));
        }
        debug!(
            "Tracking task {} at {}:{}",
            link.remote_id, link.note_path, link.line_index
        );
        self.journal.tasks.insert(link.remote_id.clone(), link);
        self.touch().await;
        Ok(())
    }

    pub async fn update_task(&mut self, remote_id: &str, update: TaskLinkUpdate) -> Result<()> {
        let link = self
            .journal
            .tasks
            .get_mut(remote_id)
            .ok_or_else(|| JournalError::NotTracked(remote_id.to_string()))?;
        update.apply(link);
        self.touch().await;
        Ok(())
    }

    pub async fn remove_task(&mut self, remote_id: &str) -> Option<TaskLink> {
        let removed = self.journal.tasks.remove(remote_id);
        if removed.is_some() {
            self.touch().await;
        }
        removed
    }

    pub fn get_task(&self, remote_id: &str) -> Option<&TaskLink> {
        self.journal.tasks.get(remote_id)
    }

    pub fn is_tracked(&self, remote_id: &str) -> bool {
        self.journal.tasks.contains_key(remote_id)
    }

    /// All live tasks, ordered by path then line.
    pub fn get_all_tasks(&self) -> Vec<TaskLink> {
        let mut tasks: Vec<TaskLink> = self.journal.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.note_path
                .cmp(&b.note_path)
                .then(a.line_index.cmp(&b.line_index))
                .then(a.remote_id.cmp(&b.remote_id))
        });
        tasks
    }

    pub fn task_count(&self) -> usize {
        self.journal.tasks.len()
    }

    /// Tasks whose state justifies a remote check this cycle.
    pub fn get_tasks_needing_sync(&self, settings: &SyncSettings, now: u64) -> Vec<TaskLink> {
        self.get_all_tasks()
            .into_iter()
            .filter(|link| policy::should_check_remote_now(link, settings, now))
            .collect()
    }

    // ==================== Tombstones ====================

    /// Tombstone a task. Removes the live entry and any queued operations for it.
    pub async fn mark_deleted(
        &mut self,
        remote_id: &str,
        reason: DeletionReason,
        http_status: Option<u16>,
        last_path: Option<String>,
        note: Option<String>,
    ) {
        let live = self.journal.tasks.remove(remote_id);
        let last_known_path = last_path.or_else(|| live.map(|l| l.note_path));

        self.journal
            .pending_operations
            .retain(|op| op.task_ref != remote_id);
        self.journal
            .failed_operations
            .retain(|op| op.task_ref != remote_id);

        info!(
            "Tombstoned task {} ({:?}, status {:?})",
            remote_id, reason, http_status
        );
        self.journal.deleted_tasks.insert(
            remote_id.to_string(),
            DeletedTaskLink {
                remote_id: remote_id.to_string(),
                reason,
                http_status,
                deleted_at: self.clock.now_millis(),
                last_known_path,
                note,
            },
        );
        self.touch().await;
    }

    pub fn is_deleted(&self, remote_id: &str) -> bool {
        self.journal.deleted_tasks.contains_key(remote_id)
    }

    pub fn get_deleted_task(&self, remote_id: &str) -> Option<&DeletedTaskLink> {
        self.journal.deleted_tasks.get(remote_id)
    }

    pub fn deleted_count(&self) -> usize {
        self.journal.deleted_tasks.len()
    }

    // ==================== Operations ====================

    /// Queue an operation. Returns false when an equivalent operation is
    /// already pending.
    pub async fn enqueue_operation(&mut self, op: SyncOperation) -> bool {
        if self
            .journal
            .pending_operations
            .iter()
            .any(|existing| existing.is_equivalent(&op))
        {
            debug!(
                "Operation {} for {} already pending, not queued again",
                op.direction, op.task_ref
            );
            return false;
        }
        self.journal.pending_operations.push(op);
        self.touch().await;
        true
    }

    /// Remove a finished operation from whichever queue holds it.
    pub async fn complete_operation(&mut self, id: &str) -> Option<SyncOperation> {
        let mut op = take_operation(&mut self.journal.pending_operations, id)
            .or_else(|| take_operation(&mut self.journal.failed_operations, id))?;
        op.status = OperationStatus::Completed;
        op.last_attempt_at = Some(self.clock.now_millis());
        self.touch().await;
        Some(op)
    }

    /// Move an operation to the failed queue with an incremented retry count.
    pub async fn fail_operation(&mut self, id: &str, error: &str) -> Option<SyncOperation> {
        let mut op = take_operation(&mut self.journal.pending_operations, id)
            .or_else(|| take_operation(&mut self.journal.failed_operations, id))?;
        op.status = OperationStatus::Failed;
        op.retry_count += 1;
        op.last_attempt_at = Some(self.clock.now_millis());
        op.last_error = Some(error.to_string());
        self.journal.failed_operations.push(op.clone());
        self.touch().await;
        Some(op)
    }

    /// Drop an operation without recording an outcome.
    pub async fn discard_operation(&mut self, id: &str) -> Option<SyncOperation> {
        let op = take_operation(&mut self.journal.pending_operations, id)
            .or_else(|| take_operation(&mut self.journal.failed_operations, id))?;
        self.touch().await;
        Some(op)
    }

    pub fn get_pending_operations(&self) -> Vec<SyncOperation> {
        self.journal.pending_operations.clone()
    }

    pub fn get_failed_operations(&self) -> Vec<SyncOperation> {
        self.journal.failed_operations.clone()
    }

    pub fn has_pending_operation(&self, remote_id: &str, direction: SyncDirection) -> bool {
        self.journal
            .pending_operations
            .iter()
            .any(|op| op.task_ref == remote_id && op.direction == direction)
    }

    /// An operation with this task, direction and target state is pending or
    /// awaiting retry.
    pub fn has_queued_operation(&self, remote_id: &str, direction: SyncDirection, state: bool) -> bool {
        self.journal
            .pending_operations
            .iter()
            .chain(self.journal.failed_operations.iter())
            .any(|op| {
                op.task_ref == remote_id && op.direction == direction && op.new_completion_state == state
            })
    }

    // ==================== Stats & watermarks ====================

    pub async fn update_stats(&mut self, update: StatsUpdate) {
        let stats = &mut self.journal.stats;
        stats.total_syncs += update.add_syncs;
        stats.successful_operations += update.add_successful_operations;
        stats.failed_operations += update.add_failed_operations;
        if let Some(v) = update.new_tasks_last_sync {
            stats.new_tasks_last_sync = v;
        }
        if let Some(v) = update.last_sync_duration_ms {
            stats.last_sync_duration_ms = v;
        }
        if let Some(v) = update.last_sync_at {
            stats.last_sync_at = v;
        }
        if let Some(v) = update.api_calls_last_sync {
            stats.api_calls_last_sync = v;
            stats.api_calls_total += v;
        }
        if let Some(v) = update.last_error {
            stats.last_error = v;
        }
        stats.tasks_tracked = self.journal.tasks.len();
        stats.tasks_deleted = self.journal.deleted_tasks.len();
        self.touch().await;
    }

    pub fn get_stats(&self) -> SyncStats {
        let mut stats = self.journal.stats.clone();
        stats.tasks_tracked = self.journal.tasks.len();
        stats.tasks_deleted = self.journal.deleted_tasks.len();
        stats
    }

    /// Time of the last successful vault scan (0 = never).
    pub fn scan_watermark(&self) -> u64 {
        self.journal.last_obsidian_scan
    }

    pub async fn set_scan_watermark(&mut self, at: u64) {
        self.journal.last_obsidian_scan = at;
        self.touch().await;
    }

    pub async fn set_sync_timestamp(&mut self, at: u64) {
        self.journal.last_sync_timestamp = at;
        self.journal.last_todoist_sync = at;
        self.touch().await;
    }

    // ==================== Maintenance ====================

    /// Snapshot the current journal before a risky bulk mutation.
    pub async fn create_backup(&self, label: &str) -> Result<String> {
        let contents = serde_json::to_string_pretty(&self.journal)?;
        let name = self.backend.backup(label, &contents).await?;
        info!("Created journal backup {}", name);
        Ok(name)
    }

    /// Wipe the journal for a full resync. Always persists immediately.
    pub async fn reset_journal(&mut self) -> Result<()> {
        warn!(
            "Resetting sync journal ({} tasks, {} tombstones dropped)",
            self.journal.tasks.len(),
            self.journal.deleted_tasks.len()
        );
        self.journal = SyncJournal::default();
        self.dirty = true;
        self.save().await
    }

    /// Read-only view of the whole document.
    pub fn journal(&self) -> &SyncJournal {
        &self.journal
    }
}

fn take_operation(queue: &mut Vec<SyncOperation>, id: &str) -> Option<SyncOperation> {
    let index = queue.iter().position(|op| op.id == id)?;
    Some(queue.remove(index))
}
