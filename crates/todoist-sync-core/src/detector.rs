//! ChangeDetector: decides what changed on either side since the last check.
//!
//! Two passes per cycle:
//!
//! 1. **Discovery** finds linked task lines not yet in the journal, fetches
//!    each remote task once and starts tracking it. The scan is incremental
//!    (files modified since the scan watermark) unless the watermark is
//!    missing or stale, or too few tasks are tracked to trust it.
//! 2. **Divergence** re-observes every tracked task. The local side is read
//!    from the note every cycle (cheap, cached per file); the remote side is
//!    fetched only when [`policy::should_check_remote_now`] says so.
//!
//! Remote fetch failures are classified once, in
//! [`ChangeDetector::fetch_with_classification`]: 404/403 tombstone the task,
//! 429 is retried with backoff inside the same call, anything else skips the
//! task for this cycle.
//!
//! The detector never holds the journal; callers lend it a
//! `&mut SyncJournalStore` for the duration of a pass.

use crate::clock::Clock;
use crate::error::Result;
use crate::fs::{LocalNoteStore, LocalStoreError};
use crate::hash::hash_content;
use crate::journal::{DeletionReason, SyncDirection, SyncOperation, TaskLink, TaskLinkUpdate};
use crate::locator::{self, LocatedTask, TaskStatus};
use crate::policy;
use crate::remote::{RemoteError, RemoteTask, RemoteTaskStore};
use crate::settings::SyncSettings;
use crate::store::SyncJournalStore;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a remote read after classification.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(RemoteTask),
    /// Permanently unreadable; the task must be tombstoned
    Gone {
        reason: DeletionReason,
        status: u16,
        message: String,
    },
    /// Transient failure; try again next cycle
    Unavailable(String),
}

/// What a detection pass found.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new_tasks: usize,
    pub relocated: usize,
    pub files_scanned: usize,
    pub full_scan: bool,
    pub tombstoned: Vec<String>,
    pub operations: Vec<SyncOperation>,
    pub errors: Vec<String>,
}

impl ChangeSet {
    pub fn absorb(&mut self, other: ChangeSet) {
        self.new_tasks += other.new_tasks;
        self.relocated += other.relocated;
        self.files_scanned += other.files_scanned;
        self.full_scan |= other.full_scan;
        self.tombstoned.extend(other.tombstoned);
        self.operations.extend(other.operations);
        self.errors.extend(other.errors);
    }
}

/// A linked task in the vault the journal knows nothing about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTask {
    pub remote_id: String,
    pub note_path: String,
    pub note_id: String,
    pub line_index: usize,
    pub line: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default)]
pub struct CompletenessReport {
    pub files_scanned: usize,
    pub files_unreadable: usize,
    pub linked_found: usize,
    pub missing: Vec<MissingTask>,
}

impl CompletenessReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealReport {
    pub backup: Option<String>,
    pub added: usize,
    pub tombstoned: usize,
    pub operations: Vec<SyncOperation>,
}

/// Note contents read during one pass, keyed by path. A `None` entry records
/// that the note does not exist.
#[derive(Debug, Default)]
pub struct NoteCache {
    notes: HashMap<String, Option<Arc<Vec<String>>>>,
}

impl NoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lines(
        &mut self,
        store: &dyn LocalNoteStore,
        path: &str,
    ) -> std::result::Result<Option<Arc<Vec<String>>>, LocalStoreError> {
        if let Some(cached) = self.notes.get(path) {
            return Ok(cached.clone());
        }
        let lines = match store.read_file(path).await {
            Ok(content) => Some(Arc::new(content.lines().map(str::to_string).collect())),
            Err(LocalStoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        self.notes.insert(path.to_string(), lines.clone());
        Ok(lines)
    }

    /// Forget a note after it has been rewritten.
    pub fn invalidate(&mut self, path: &str) {
        self.notes.remove(path);
    }
}

/// Where a tracked task currently is in the vault.
#[derive(Debug, Clone)]
struct LocalObservation {
    path: String,
    line_index: usize,
    line: String,
}

/// Decide which operation, if any, reconciles the two observed states.
///
/// `local_flipped`/`remote_flipped` say whether each side changed since the
/// journal's last observation. When both flipped and still disagree the
/// local side wins. When neither flipped but the states disagree (a previous
/// operation never ran), the completed side wins.
pub fn resolve_operation(
    local_completed: bool,
    remote_completed: bool,
    local_flipped: bool,
    remote_flipped: bool,
) -> Option<(SyncDirection, bool)> {
    if local_completed == remote_completed {
        return None;
    }
    match (local_flipped, remote_flipped) {
        (true, _) => Some((SyncDirection::LocalToRemote, local_completed)),
        (false, true) => Some((SyncDirection::RemoteToLocal, remote_completed)),
        (false, false) if local_completed => Some((SyncDirection::LocalToRemote, true)),
        (false, false) => Some((SyncDirection::RemoteToLocal, true)),
    }
}

pub struct ChangeDetector {
    local: Arc<dyn LocalNoteStore>,
    remote: Arc<dyn RemoteTaskStore>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl ChangeDetector {
    pub fn new(
        local: Arc<dyn LocalNoteStore>,
        remote: Arc<dyn RemoteTaskStore>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            local,
            remote,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Discovery followed by divergence.
    pub async fn detect_changes(&self, journal: &mut SyncJournalStore) -> ChangeSet {
        let mut changes = self.discover_new_tasks(journal).await;
        changes.absorb(self.detect_divergence(journal).await);
        changes
    }

    // ==================== Discovery ====================

    /// Whether the next discovery pass must scan every file.
    pub fn needs_full_scan(&self, journal: &SyncJournalStore, now: u64) -> bool {
        let watermark = journal.scan_watermark();
        watermark == 0
            || now.saturating_sub(watermark) > self.settings.full_scan_after_ms()
            || journal.task_count() < self.settings.min_tracked_for_incremental
    }

    pub async fn discover_new_tasks(&self, journal: &mut SyncJournalStore) -> ChangeSet {
        let scan_start = self.clock.now_millis();
        let watermark = journal.scan_watermark();
        let mut changes = ChangeSet {
            full_scan: self.needs_full_scan(journal, scan_start),
            ..Default::default()
        };

        let files = match self.local.list_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list notes: {}", e);
                changes.errors.push(format!("listing notes: {}", e));
                return changes;
            }
        };

        let full_scan = changes.full_scan;
        let mut clean = true;
        let mut seen = HashSet::new();
        for file in files
            .iter()
            .filter(|f| full_scan || f.mtime_millis > watermark)
        {
            changes.files_scanned += 1;
            if !self
                .discover_in_file(journal, &file.path, &mut seen, &mut changes)
                .await
            {
                clean = false;
            }
        }

        if clean {
            journal.set_scan_watermark(scan_start).await;
        } else {
            debug!("Discovery incomplete, scan watermark left at {}", watermark);
        }

        info!(
            "Discovery scanned {} files ({}): {} new, {} relocated, {} tombstoned",
            changes.files_scanned,
            if changes.full_scan { "full" } else { "incremental" },
            changes.new_tasks,
            changes.relocated,
            changes.tombstoned.len()
        );
        changes
    }

    /// Track every untracked linked task in one note.
    ///
    /// Returns false if the note could not be read or a remote read failed
    /// transiently, so the caller keeps the file eligible for the next scan.
    pub async fn discover_in_file(
        &self,
        journal: &mut SyncJournalStore,
        path: &str,
        seen: &mut HashSet<String>,
        changes: &mut ChangeSet,
    ) -> bool {
        let content = match self.local.read_file(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", path, e);
                changes.errors.push(format!("{}: {}", path, e));
                return false;
            }
        };
        let located = locator::scan_linked_tasks(&content);
        if located.is_empty() {
            return true;
        }
        let note_id = self.note_id_for(path).await;

        let mut clean = true;
        for task in located {
            if !seen.insert(task.remote_id.clone()) || journal.is_deleted(&task.remote_id) {
                continue;
            }
            if let Some(link) = journal.get_task(&task.remote_id) {
                if link.note_path != path || link.line_index != task.line_index {
                    debug!(
                        "Task {} moved from {}:{} to {}:{}",
                        task.remote_id, link.note_path, link.line_index, path, task.line_index
                    );
                    let update = TaskLinkUpdate {
                        note_path: Some(path.to_string()),
                        line_index: Some(task.line_index),
                        note_id: (!note_id.is_empty()).then(|| note_id.clone()),
                        ..Default::default()
                    };
                    if journal.update_task(&task.remote_id, update).await.is_ok() {
                        changes.relocated += 1;
                    }
                }
                continue;
            }
            if !self
                .track_new_task(journal, path, &note_id, &task, changes)
                .await
            {
                clean = false;
            }
        }
        clean
    }

    async fn track_new_task(
        &self,
        journal: &mut SyncJournalStore,
        path: &str,
        note_id: &str,
        task: &LocatedTask,
        changes: &mut ChangeSet,
    ) -> bool {
        match self.fetch_with_classification(&task.remote_id).await {
            FetchOutcome::Found(remote) => {
                let now = self.clock.now_millis();
                let link = new_link(path, note_id, task.line_index, &task.line, &remote, now);
                let op = self.disagreement_op(journal, &link, remote.completed_at, &task.line, now);
                if let Err(e) = journal.add_task(link).await {
                    changes.errors.push(e.to_string());
                    return true;
                }
                changes.new_tasks += 1;
                changes.operations.extend(op);
                true
            }
            FetchOutcome::Gone {
                reason,
                status,
                message,
            } => {
                journal
                    .mark_deleted(
                        &task.remote_id,
                        reason,
                        Some(status),
                        Some(path.to_string()),
                        Some(message),
                    )
                    .await;
                changes.tombstoned.push(task.remote_id.clone());
                true
            }
            FetchOutcome::Unavailable(message) => {
                changes
                    .errors
                    .push(format!("{}: {}", task.remote_id, message));
                false
            }
        }
    }

    /// Operation for a task first seen with its two sides disagreeing.
    fn disagreement_op(
        &self,
        journal: &SyncJournalStore,
        link: &TaskLink,
        remote_completed_at: Option<DateTime<Utc>>,
        line: &str,
        now: u64,
    ) -> Option<SyncOperation> {
        let (direction, state) =
            resolve_operation(link.local_completed, link.remote_completed, false, false)?;
        if journal.has_queued_operation(&link.remote_id, direction, state) {
            return None;
        }
        Some(
            SyncOperation::new(direction, &link.remote_id, state, now)
                .with_remote_completed_at(remote_completed_at)
                .with_local_content(line),
        )
    }

    async fn note_id_for(&self, path: &str) -> String {
        match self.local.resolve_note_id(path).await {
            Ok(id) => id.unwrap_or_default(),
            Err(e) => {
                debug!("No note id for {}: {}", path, e);
                String::new()
            }
        }
    }

    // ==================== Divergence ====================

    /// Re-observe every tracked task and produce reconciling operations.
    pub async fn detect_divergence(&self, journal: &mut SyncJournalStore) -> ChangeSet {
        let mut changes = ChangeSet::default();
        let mut notes = NoteCache::new();
        for link in journal.get_all_tasks() {
            if let Some(op) = self
                .check_task(journal, &link.remote_id, false, &mut notes, &mut changes)
                .await
            {
                changes.operations.push(op);
            }
        }
        debug!(
            "Divergence pass: {} operations, {} errors",
            changes.operations.len(),
            changes.errors.len()
        );
        changes
    }

    /// Observe one tracked task on both sides and update its journal entry.
    ///
    /// With `force` the remote is fetched regardless of the timing policy.
    /// Returns the operation needed to reconcile the two sides, unless an
    /// equivalent one is already queued.
    pub async fn check_task(
        &self,
        journal: &mut SyncJournalStore,
        remote_id: &str,
        force: bool,
        notes: &mut NoteCache,
        changes: &mut ChangeSet,
    ) -> Option<SyncOperation> {
        let link = journal.get_task(remote_id)?.clone();
        let now = self.clock.now_millis();
        let mut update = TaskLinkUpdate::default();

        // Local side
        let mut local_completed = link.local_completed;
        let mut local_line = None;
        match self.observe_local(&link, notes).await {
            Ok(Some(observed)) => {
                if observed.path != link.note_path {
                    update.note_path = Some(observed.path.clone());
                }
                if observed.line_index != link.line_index {
                    update.line_index = Some(observed.line_index);
                }
                let hash = hash_content(&observed.line);
                if hash != link.local_content_hash {
                    match locator::task_status(&observed.line) {
                        Some(TaskStatus::Open) => local_completed = false,
                        Some(TaskStatus::Completed) => local_completed = true,
                        Some(TaskStatus::Other(_)) | None => {}
                    }
                    update.local_content_hash = Some(hash);
                }
                update.last_local_check = Some(now);
                local_line = Some(observed.line);
            }
            Ok(None) => {
                debug!(
                    "Task {} not found in {}, local side unchanged",
                    remote_id, link.note_path
                );
            }
            Err(e) => {
                warn!("Failed to read {}: {}", link.note_path, e);
                changes.errors.push(format!("{}: {}", link.note_path, e));
            }
        }
        update.local_completed = Some(local_completed);

        // Remote side
        let mut remote_completed = link.remote_completed;
        let mut remote_completed_at = None;
        let mut probe = link.clone();
        probe.local_completed = local_completed;
        if force || policy::should_check_remote_now(&probe, &self.settings, now) {
            match self.fetch_with_classification(remote_id).await {
                FetchOutcome::Found(remote) => {
                    remote_completed = remote.completed;
                    remote_completed_at = remote.completed_at;
                    update.remote_completed = Some(remote.completed);
                    update.remote_content_hash = Some(hash_content(&remote.content));
                    update.remote_due_date = Some(remote.due_date);
                    update.last_remote_check = Some(now);
                }
                FetchOutcome::Gone {
                    reason,
                    status,
                    message,
                } => {
                    journal
                        .mark_deleted(remote_id, reason, Some(status), None, Some(message))
                        .await;
                    changes.tombstoned.push(remote_id.to_string());
                    return None;
                }
                FetchOutcome::Unavailable(message) => {
                    changes.errors.push(format!("{}: {}", remote_id, message));
                }
            }
        }

        if let Err(e) = journal.update_task(remote_id, update).await {
            warn!("Failed to record observation of {}: {}", remote_id, e);
        }

        let (direction, state) = resolve_operation(
            local_completed,
            remote_completed,
            local_completed != link.local_completed,
            remote_completed != link.remote_completed,
        )?;
        if journal.has_queued_operation(remote_id, direction, state) {
            debug!("Operation {} for {} already queued", direction, remote_id);
            return None;
        }
        info!(
            "Task {} needs {} sync (local {}, remote {})",
            remote_id, direction, local_completed, remote_completed
        );
        let mut op = SyncOperation::new(direction, remote_id, state, now)
            .with_remote_completed_at(remote_completed_at);
        if let Some(line) = local_line {
            op = op.with_local_content(&line);
        }
        Some(op)
    }

    /// Find the task's current line, following a moved note by its id and a
    /// moved line by its link. `Ok(None)` when the task is nowhere to be found.
    async fn observe_local(
        &self,
        link: &TaskLink,
        notes: &mut NoteCache,
    ) -> std::result::Result<Option<LocalObservation>, LocalStoreError> {
        let (path, lines) = match notes.lines(self.local.as_ref(), &link.note_path).await? {
            Some(lines) => (link.note_path.clone(), lines),
            None => {
                if link.note_id.is_empty() {
                    return Ok(None);
                }
                let Some(moved) = self.local.find_by_note_id(&link.note_id).await? else {
                    return Ok(None);
                };
                match notes.lines(self.local.as_ref(), &moved).await? {
                    Some(lines) => {
                        info!("Note for task {} moved to {}", link.remote_id, moved);
                        (moved, lines)
                    }
                    None => return Ok(None),
                }
            }
        };

        let lines = lines.as_slice();
        let line_index = if locator::find_linked_remote_id(lines, link.line_index).as_deref()
            == Some(link.remote_id.as_str())
        {
            link.line_index
        } else {
            match locator::locate_task(lines, &link.remote_id) {
                Some(index) => index,
                None => return Ok(None),
            }
        };

        Ok(Some(LocalObservation {
            path,
            line_index,
            line: lines[line_index].clone(),
        }))
    }

    // ==================== Remote reads ====================

    /// Fetch a remote task, retrying rate-limited reads with backoff.
    pub async fn fetch_with_classification(&self, remote_id: &str) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            match self.remote.get_task(remote_id).await {
                Ok(task) => return FetchOutcome::Found(task),
                Err(e) if e.is_permanent() => {
                    let reason = match e {
                        RemoteError::Forbidden(_) => DeletionReason::Inaccessible,
                        _ => DeletionReason::Deleted,
                    };
                    info!("Remote task {} is gone: {}", remote_id, e);
                    return FetchOutcome::Gone {
                        reason,
                        status: e.status().unwrap_or(404),
                        message: e.to_string(),
                    };
                }
                Err(RemoteError::RateLimited { retry_after })
                    if attempt < self.settings.rate_limit_retries =>
                {
                    attempt += 1;
                    let delay =
                        retry_after.unwrap_or_else(|| self.settings.rate_limit_delay(attempt));
                    warn!(
                        "Rate limited fetching {}, retry {} in {:?}",
                        remote_id, attempt, delay
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => {
                    warn!("Failed to fetch remote task {}: {}", remote_id, e);
                    return FetchOutcome::Unavailable(e.to_string());
                }
            }
        }
    }

    // ==================== Bulk healing ====================

    /// Rescan the whole vault and list linked tasks the journal does not know.
    pub async fn validate_completeness(
        &self,
        journal: &SyncJournalStore,
    ) -> Result<CompletenessReport> {
        let mut report = CompletenessReport::default();
        let mut seen = HashSet::new();

        for file in self.local.list_files().await? {
            report.files_scanned += 1;
            let content = match self.local.read_file(&file.path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed to read {}: {}", file.path, e);
                    report.files_unreadable += 1;
                    continue;
                }
            };
            let located = locator::scan_linked_tasks(&content);
            if located.is_empty() {
                continue;
            }
            let note_id = self.note_id_for(&file.path).await;
            for task in located {
                if !seen.insert(task.remote_id.clone()) {
                    continue;
                }
                report.linked_found += 1;
                if journal.is_tracked(&task.remote_id) || journal.is_deleted(&task.remote_id) {
                    continue;
                }
                report.missing.push(MissingTask {
                    remote_id: task.remote_id,
                    note_path: file.path.clone(),
                    note_id: note_id.clone(),
                    line_index: task.line_index,
                    line: task.line,
                    status: task.status,
                });
            }
        }

        info!(
            "Journal completeness: {} linked tasks in {} files, {} missing",
            report.linked_found,
            report.files_scanned,
            report.missing.len()
        );
        Ok(report)
    }

    /// Add or tombstone every missing task with a single bulk listing call.
    pub async fn heal_missing(
        &self,
        journal: &mut SyncJournalStore,
        missing: &[MissingTask],
    ) -> Result<HealReport> {
        let mut report = HealReport::default();
        if missing.is_empty() {
            return Ok(report);
        }

        match journal.create_backup("pre-heal").await {
            Ok(name) => report.backup = Some(name),
            Err(e) => warn!("Failed to back up journal before healing: {}", e),
        }

        let listing: HashMap<String, RemoteTask> = self
            .remote
            .list_tasks()
            .await?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        let now = self.clock.now_millis();
        for task in missing {
            if journal.is_tracked(&task.remote_id) || journal.is_deleted(&task.remote_id) {
                continue;
            }
            match listing.get(&task.remote_id) {
                Some(remote) => {
                    let link = new_link(
                        &task.note_path,
                        &task.note_id,
                        task.line_index,
                        &task.line,
                        remote,
                        now,
                    );
                    let op = self.disagreement_op(journal, &link, remote.completed_at, &task.line, now);
                    journal.add_task(link).await?;
                    report.added += 1;
                    report.operations.extend(op);
                }
                None => {
                    journal
                        .mark_deleted(
                            &task.remote_id,
                            DeletionReason::Inaccessible,
                            None,
                            Some(task.note_path.clone()),
                            Some("absent from bulk listing".to_string()),
                        )
                        .await;
                    report.tombstoned += 1;
                }
            }
        }

        info!(
            "Healed journal: {} tasks added, {} tombstoned",
            report.added, report.tombstoned
        );
        Ok(report)
    }
}

/// Journal entry for a task seen on both sides for the first time.
fn new_link(
    path: &str,
    note_id: &str,
    line_index: usize,
    line: &str,
    remote: &RemoteTask,
    now: u64,
) -> TaskLink {
    TaskLink {
        remote_id: remote.id.clone(),
        note_id: note_id.to_string(),
        note_path: path.to_string(),
        line_index,
        local_completed: locator::task_status(line).is_some_and(TaskStatus::is_completed),
        remote_completed: remote.completed,
        local_content_hash: hash_content(line),
        remote_content_hash: hash_content(&remote.content),
        last_local_check: now,
        last_remote_check: now,
        last_sync_operation: 0,
        remote_due_date: remote.due_date,
        discovered_at: now,
        last_path_validation: Some(now),
    }
}
