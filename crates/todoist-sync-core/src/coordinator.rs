//! SyncCoordinator: runs sync cycles and executes the operations they produce.
//!
//! A cycle moves through [`SyncPhase::Discovery`], [`SyncPhase::Operations`],
//! [`SyncPhase::Retry`] and always ends in [`SyncPhase::Complete`]. Errors
//! inside the cycle are collected in the [`SyncReport`] instead of aborting
//! it; one summary is sent to the notifier at the end.
//!
//! The coordinator owns the [`SyncJournalStore`]. Methods take `&mut self`, so
//! two cycles can never interleave on the same journal; the service layer
//! decides whether a caller waits or skips.

use crate::clock::Clock;
use crate::detector::{ChangeDetector, ChangeSet, HealReport, NoteCache};
use crate::error::{Result, SyncError};
use crate::fs::{LocalNoteStore, LocalStoreError};
use crate::hash::hash_content;
use crate::journal::{
    DeletionReason, StatsUpdate, SyncDirection, SyncOperation, SyncStats, TaskLink, TaskLinkUpdate,
};
use crate::locator;
use crate::notifier::{SyncPhase, UserNotifier};
use crate::policy;
use crate::remote::{MeteredRemote, RemoteTaskStore, TaskUpdate};
use crate::retry;
use crate::settings::{SyncSettings, TimestampSource};
use crate::store::SyncJournalStore;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    Failed(String),
    /// Removed without running: the task is tombstoned, untracked, or the
    /// operation no longer matches the journal
    Dropped,
}

/// Summary of one cycle or manual sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub new_tasks: usize,
    pub operations_completed: usize,
    pub operations_failed: usize,
    pub operations_dropped: usize,
    pub retried: usize,
    pub tombstoned: usize,
    pub api_calls: u64,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn record(&mut self, outcome: &OperationOutcome) {
        match outcome {
            OperationOutcome::Completed => self.operations_completed += 1,
            OperationOutcome::Failed(e) => {
                self.operations_failed += 1;
                self.errors.push(e.clone());
            }
            OperationOutcome::Dropped => self.operations_dropped += 1,
        }
    }

    fn absorb_changes(&mut self, changes: &ChangeSet) {
        self.new_tasks += changes.new_tasks;
        self.tombstoned += changes.tombstoned.len();
        self.errors.extend(changes.errors.iter().cloned());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// One-line summary for the notifier.
    pub fn summary(&self) -> String {
        format!(
            "{} new, {} synced, {} failed, {} tombstoned",
            self.new_tasks, self.operations_completed, self.operations_failed, self.tombstoned
        )
    }
}

/// Outcome of start-up maintenance on a loaded journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub note_ids_assigned: usize,
    pub paths_corrected: usize,
    pub tombstoned: usize,
}

pub struct SyncCoordinator {
    journal: SyncJournalStore,
    detector: ChangeDetector,
    local: Arc<dyn LocalNoteStore>,
    remote: Arc<MeteredRemote>,
    notifier: Arc<dyn UserNotifier>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncCoordinator {
    pub fn new(
        journal: SyncJournalStore,
        local: Arc<dyn LocalNoteStore>,
        remote: Arc<dyn RemoteTaskStore>,
        notifier: Arc<dyn UserNotifier>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let remote = Arc::new(MeteredRemote::new(remote));
        let detector = ChangeDetector::new(
            Arc::clone(&local),
            remote.clone(),
            Arc::clone(&clock),
            settings.clone(),
        );
        Self {
            journal,
            detector,
            local,
            remote,
            notifier,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn journal(&self) -> &SyncJournalStore {
        &self.journal
    }

    pub fn stats(&self) -> SyncStats {
        self.journal.get_stats()
    }

    /// Persist any unsaved journal changes.
    pub async fn flush(&mut self) -> Result<()> {
        self.journal.force_save_if_dirty().await?;
        Ok(())
    }

    // ==================== Start-up ====================

    /// Load the journal, give legacy entries a note id and repair paths.
    pub async fn initialize(&mut self) -> InitReport {
        self.journal.load().await;
        self.journal.set_auto_save(false);

        let mut report = InitReport {
            note_ids_assigned: self.migrate_note_ids().await,
            ..Default::default()
        };
        self.validate_paths(&mut report).await;

        self.journal.set_auto_save(true);
        if let Err(e) = self.journal.force_save_if_dirty().await {
            error!("Failed to save journal after start-up maintenance: {}", e);
        }
        info!(
            "Journal ready: {} ids assigned, {} paths corrected, {} tombstoned",
            report.note_ids_assigned, report.paths_corrected, report.tombstoned
        );
        report
    }

    async fn migrate_note_ids(&mut self) -> usize {
        let mut assigned = 0;
        for link in self.journal.get_all_tasks() {
            if !link.note_id.is_empty() {
                continue;
            }
            match self.local.resolve_note_id(&link.note_path).await {
                Ok(Some(note_id)) => {
                    let update = TaskLinkUpdate {
                        note_id: Some(note_id),
                        ..Default::default()
                    };
                    if self.journal.update_task(&link.remote_id, update).await.is_ok() {
                        assigned += 1;
                    }
                }
                Ok(None) => debug!("No note id available for {}", link.note_path),
                Err(e) => warn!("Failed to resolve note id for {}: {}", link.note_path, e),
            }
        }
        assigned
    }

    async fn validate_paths(&mut self, report: &mut InitReport) {
        let existing: HashSet<String> = match self.local.list_files().await {
            Ok(files) => files.into_iter().map(|f| f.path).collect(),
            Err(e) => {
                warn!("Skipping path validation, cannot list notes: {}", e);
                return;
            }
        };

        let now = self.clock.now_millis();
        for link in self.journal.get_all_tasks() {
            if existing.contains(&link.note_path) {
                self.mark_path_validated(&link.remote_id, None, now).await;
                continue;
            }
            match self.find_moved_note(&link).await {
                Some(path) => {
                    info!(
                        "Task {} note moved from {} to {}",
                        link.remote_id, link.note_path, path
                    );
                    self.mark_path_validated(&link.remote_id, Some(path), now)
                        .await;
                    report.paths_corrected += 1;
                }
                None => {
                    self.journal
                        .mark_deleted(
                            &link.remote_id,
                            DeletionReason::UserRemoved,
                            None,
                            Some(link.note_path.clone()),
                            Some("note no longer in vault".to_string()),
                        )
                        .await;
                    report.tombstoned += 1;
                }
            }
        }
    }

    async fn find_moved_note(&self, link: &TaskLink) -> Option<String> {
        if link.note_id.is_empty() {
            return None;
        }
        match self.local.find_by_note_id(&link.note_id).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Failed to look up note {}: {}", link.note_id, e);
                None
            }
        }
    }

    async fn mark_path_validated(&mut self, remote_id: &str, path: Option<String>, now: u64) {
        let update = TaskLinkUpdate {
            note_path: path,
            last_path_validation: Some(now),
            ..Default::default()
        };
        if let Err(e) = self.journal.update_task(remote_id, update).await {
            warn!("Failed to record path validation for {}: {}", remote_id, e);
        }
    }

    // ==================== Cycle ====================

    /// Run one full sync cycle.
    pub async fn perform_sync(&mut self) -> SyncReport {
        let started = self.clock.now_millis();
        self.remote.take_calls();
        self.journal.set_auto_save(false);
        let mut report = SyncReport::default();

        self.notifier
            .progress(SyncPhase::Discovery, "Scanning vault for changes");
        let discovered = self.detector.discover_new_tasks(&mut self.journal).await;
        self.enqueue_all(discovered.operations.clone()).await;
        report.absorb_changes(&discovered);

        let divergence = self.detector.detect_divergence(&mut self.journal).await;
        self.enqueue_all(divergence.operations.clone()).await;
        report.absorb_changes(&divergence);

        let pending = self.journal.get_pending_operations();
        self.notifier.progress(
            SyncPhase::Operations,
            &format!("Executing {} operations", pending.len()),
        );
        for op in pending {
            let outcome = self.execute_operation(&op).await;
            report.record(&outcome);
        }

        self.notifier
            .progress(SyncPhase::Retry, "Retrying failed operations");
        self.retry_failed(&mut report).await;

        self.finish(started, &mut report, true).await;
        report
    }

    async fn enqueue_all(&mut self, operations: Vec<SyncOperation>) {
        for op in operations {
            self.journal.enqueue_operation(op).await;
        }
    }

    /// Retry every failed operation whose backoff has elapsed.
    async fn retry_failed(&mut self, report: &mut SyncReport) {
        let now = self.clock.now_millis();
        let due: Vec<SyncOperation> = self
            .journal
            .get_failed_operations()
            .into_iter()
            .filter(|op| retry::is_retry_due(op, now))
            .collect();
        if !due.is_empty() {
            info!("Retrying {} failed operations", due.len());
        }
        for op in due {
            report.retried += 1;
            let outcome = self.execute_operation(&op).await;
            report.record(&outcome);
        }
    }

    /// Record stats, save the journal and report the cycle.
    async fn finish(&mut self, started: u64, report: &mut SyncReport, full_cycle: bool) {
        let now = self.clock.now_millis();
        report.duration_ms = now.saturating_sub(started);
        report.api_calls = self.remote.take_calls();

        let last_error = report.errors.last().cloned();
        self.journal
            .update_stats(StatsUpdate {
                add_syncs: u64::from(full_cycle),
                add_successful_operations: report.operations_completed as u64,
                add_failed_operations: report.operations_failed as u64,
                new_tasks_last_sync: Some(report.new_tasks),
                last_sync_duration_ms: Some(report.duration_ms),
                last_sync_at: Some(now),
                api_calls_last_sync: Some(report.api_calls),
                last_error: Some(last_error),
            })
            .await;
        if full_cycle {
            self.journal.set_sync_timestamp(now).await;
        }

        self.journal.set_auto_save(true);
        if let Err(e) = self.journal.force_save_if_dirty().await {
            error!("Failed to save sync journal: {}", e);
            report.errors.push(format!("saving journal: {}", e));
        }

        info!(
            "Sync finished in {}ms: {} ({} API calls)",
            report.duration_ms,
            report.summary(),
            report.api_calls
        );
        if report.has_errors() {
            for e in &report.errors {
                debug!("Sync error: {}", e);
            }
            self.notifier.error(&format!(
                "Sync completed with {} errors: {}",
                report.errors.len(),
                report.summary()
            ));
        }
        self.notifier
            .progress(SyncPhase::Complete, &report.summary());
    }

    // ==================== Execution ====================

    /// Apply one queued operation to its target side.
    pub async fn execute_operation(&mut self, op: &SyncOperation) -> OperationOutcome {
        let Some(link) = self.journal.get_task(&op.task_ref).cloned() else {
            debug!(
                "Dropping operation {} for untracked task {}",
                op.id, op.task_ref
            );
            self.journal.discard_operation(&op.id).await;
            return OperationOutcome::Dropped;
        };

        // The journal has moved on since the operation was queued
        let stale = match op.direction {
            SyncDirection::LocalToRemote => link.local_completed != op.new_completion_state,
            SyncDirection::RemoteToLocal => link.remote_completed != op.new_completion_state,
        };
        if stale {
            debug!("Dropping stale operation {} for {}", op.id, op.task_ref);
            self.journal.discard_operation(&op.id).await;
            return OperationOutcome::Dropped;
        }

        let result = match op.direction {
            SyncDirection::LocalToRemote => self.apply_to_remote(&link, op).await,
            SyncDirection::RemoteToLocal => self.apply_to_local(&link, op).await,
        };

        match result {
            Ok(()) => {
                self.journal.complete_operation(&op.id).await;
                OperationOutcome::Completed
            }
            Err(SyncError::Remote(e)) if e.is_permanent() => {
                let reason = if e.status() == Some(403) {
                    DeletionReason::Inaccessible
                } else {
                    DeletionReason::Deleted
                };
                self.journal
                    .mark_deleted(&op.task_ref, reason, e.status(), None, Some(e.to_string()))
                    .await;
                OperationOutcome::Dropped
            }
            Err(e) => {
                let message = format!("{} {}: {}", op.direction, op.task_ref, e);
                warn!("Operation failed: {}", message);
                self.journal.fail_operation(&op.id, &e.to_string()).await;
                OperationOutcome::Failed(message)
            }
        }
    }

    async fn apply_to_remote(&mut self, link: &TaskLink, op: &SyncOperation) -> Result<()> {
        if op.new_completion_state {
            self.remote.close_task(&link.remote_id).await?;
        } else {
            let reopen = TaskUpdate {
                completed: Some(false),
                ..Default::default()
            };
            self.remote.update_task(&link.remote_id, &reopen).await?;
        }

        let now = self.clock.now_millis();
        info!(
            "Marked remote task {} {}",
            link.remote_id,
            if op.new_completion_state { "completed" } else { "open" }
        );
        self.journal
            .update_task(
                &link.remote_id,
                TaskLinkUpdate {
                    remote_completed: Some(op.new_completion_state),
                    last_remote_check: Some(now),
                    last_sync_operation: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn apply_to_local(&mut self, link: &TaskLink, op: &SyncOperation) -> Result<()> {
        let (path, content) = match self.local.read_file(&link.note_path).await {
            Ok(content) => (link.note_path.clone(), content),
            Err(LocalStoreError::NotFound(_)) => {
                let moved = self
                    .find_moved_note(link)
                    .await
                    .ok_or_else(|| LocalStoreError::NotFound(link.note_path.clone()))?;
                let content = self.local.read_file(&moved).await?;
                (moved, content)
            }
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = content.lines().collect();

        let line_index = if locator::find_linked_remote_id(&lines, link.line_index).as_deref()
            == Some(link.remote_id.as_str())
        {
            link.line_index
        } else {
            locator::locate_task(&lines, &link.remote_id).ok_or_else(|| {
                SyncError::TaskNotFound {
                    remote_id: link.remote_id.clone(),
                    path: path.clone(),
                    line_index: link.line_index,
                }
            })?
        };

        let current = lines[line_index];
        let mut rewritten =
            locator::set_completion(current, op.new_completion_state).ok_or_else(|| {
                SyncError::TaskNotFound {
                    remote_id: link.remote_id.clone(),
                    path: path.clone(),
                    line_index,
                }
            })?;
        if op.new_completion_state && self.settings.add_completion_timestamp {
            if let Some(stamp) = self.completion_stamp(op.remote_completed_at) {
                rewritten = locator::append_completion_timestamp(&rewritten, &stamp);
            }
        }

        if rewritten != current {
            let updated = locator::replace_line(&content, line_index, &rewritten).ok_or_else(|| {
                SyncError::TaskNotFound {
                    remote_id: link.remote_id.clone(),
                    path: path.clone(),
                    line_index,
                }
            })?;
            self.local.write_file(&path, &updated).await?;
            info!(
                "Marked {}:{} {}",
                path,
                line_index,
                if op.new_completion_state { "completed" } else { "open" }
            );
        }

        let now = self.clock.now_millis();
        self.journal
            .update_task(
                &link.remote_id,
                TaskLinkUpdate {
                    note_path: Some(path),
                    line_index: Some(line_index),
                    local_completed: Some(op.new_completion_state),
                    local_content_hash: Some(hash_content(&rewritten)),
                    last_local_check: Some(now),
                    last_sync_operation: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Completion timestamp text, or `None` if the format is unusable.
    fn completion_stamp(&self, remote_completed_at: Option<DateTime<Utc>>) -> Option<String> {
        let at = match self.settings.completion_timestamp_source {
            TimestampSource::Remote => remote_completed_at,
            TimestampSource::Now => None,
        }
        .or_else(|| DateTime::from_timestamp_millis(self.clock.now_millis() as i64))?;

        let mut stamp = String::new();
        let local = at.with_timezone(&chrono::Local);
        if write!(stamp, "{}", local.format(&self.settings.completion_timestamp_format)).is_err() {
            warn!(
                "Invalid completion timestamp format {:?}",
                self.settings.completion_timestamp_format
            );
            return None;
        }
        Some(stamp)
    }

    // ==================== Manual sync ====================

    /// Sync one task now, bypassing the timing policy.
    ///
    /// Falls back to reading the task straight from the note when the journal
    /// does not track it yet.
    pub async fn sync_task(
        &mut self,
        remote_id: &str,
        path: &str,
        line_index: usize,
    ) -> Result<SyncReport> {
        if self.journal.is_deleted(remote_id) {
            return Err(SyncError::Tombstoned(remote_id.to_string()));
        }
        let started = self.clock.now_millis();
        self.remote.take_calls();
        self.journal.set_auto_save(false);
        let mut report = SyncReport::default();

        if !self.journal.is_tracked(remote_id) {
            if let Err(e) = self
                .track_from_note(remote_id, path, line_index, &mut report)
                .await
            {
                self.journal.set_auto_save(true);
                return Err(e);
            }
        }

        self.check_and_execute(&[remote_id.to_string()], &mut report)
            .await;
        self.finish(started, &mut report, false).await;
        Ok(report)
    }

    async fn track_from_note(
        &mut self,
        remote_id: &str,
        path: &str,
        line_index: usize,
        report: &mut SyncReport,
    ) -> Result<()> {
        let content = self.local.read_file(path).await?;
        let lines: Vec<&str> = content.lines().collect();
        let at_line = locator::find_linked_remote_id(&lines, line_index).as_deref() == Some(remote_id);
        if !at_line && locator::locate_task(&lines, remote_id).is_none() {
            return Err(SyncError::TaskNotFound {
                remote_id: remote_id.to_string(),
                path: path.to_string(),
                line_index,
            });
        }

        let mut changes = ChangeSet::default();
        let mut seen = HashSet::new();
        self.detector
            .discover_in_file(&mut self.journal, path, &mut seen, &mut changes)
            .await;
        self.enqueue_all(changes.operations.clone()).await;
        report.absorb_changes(&changes);
        Ok(())
    }

    /// Sync every task in one note now.
    pub async fn sync_file(&mut self, path: &str) -> Result<SyncReport> {
        let started = self.clock.now_millis();
        self.remote.take_calls();
        self.journal.set_auto_save(false);
        let mut report = SyncReport::default();

        let mut ids = self.tracked_in(path);
        if ids.is_empty() {
            info!("No journal entries for {}, discovering directly", path);
            let mut changes = ChangeSet::default();
            let mut seen = HashSet::new();
            self.detector
                .discover_in_file(&mut self.journal, path, &mut seen, &mut changes)
                .await;
            self.enqueue_all(changes.operations.clone()).await;
            report.absorb_changes(&changes);
            ids = self.tracked_in(path);
        }

        self.check_and_execute(&ids, &mut report).await;
        self.finish(started, &mut report, false).await;
        Ok(report)
    }

    fn tracked_in(&self, path: &str) -> Vec<String> {
        self.journal
            .get_all_tasks()
            .into_iter()
            .filter(|link| link.note_path == path)
            .map(|link| link.remote_id)
            .collect()
    }

    /// Sync every tracked task in the vault now, honoring the time window.
    pub async fn sync_vault(&mut self) -> Result<SyncReport> {
        let started = self.clock.now_millis();
        self.remote.take_calls();
        self.journal.set_auto_save(false);
        let mut report = SyncReport::default();

        if self.journal.task_count() == 0 {
            info!("Journal is empty, discovering the whole vault");
            let changes = self.detector.discover_new_tasks(&mut self.journal).await;
            self.enqueue_all(changes.operations.clone()).await;
            report.absorb_changes(&changes);
        }

        let now = self.clock.now_millis();
        let ids: Vec<String> = self
            .journal
            .get_all_tasks()
            .into_iter()
            .filter(|link| {
                !self.settings.time_window_enabled
                    || policy::within_time_window(link, &self.settings, now)
            })
            .map(|link| link.remote_id)
            .collect();
        info!("Manual vault sync of {} tasks", ids.len());

        self.check_and_execute(&ids, &mut report).await;
        self.finish(started, &mut report, false).await;
        Ok(report)
    }

    /// Force-check the given tasks and run whatever they need.
    async fn check_and_execute(&mut self, ids: &[String], report: &mut SyncReport) {
        let mut notes = NoteCache::new();
        let mut changes = ChangeSet::default();
        for id in ids {
            if let Some(op) = self
                .detector
                .check_task(&mut self.journal, id, true, &mut notes, &mut changes)
                .await
            {
                self.journal.enqueue_operation(op).await;
            }
        }
        report.absorb_changes(&changes);

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let queued: Vec<SyncOperation> = self
            .journal
            .get_pending_operations()
            .into_iter()
            .chain(self.journal.get_failed_operations())
            .filter(|op| wanted.contains(op.task_ref.as_str()))
            .collect();
        for op in queued {
            let outcome = self.execute_operation(&op).await;
            report.record(&outcome);
        }
    }

    // ==================== Maintenance ====================

    /// Find linked tasks missing from the journal and add or tombstone them
    /// with one bulk remote listing.
    pub async fn heal_journal(&mut self) -> Result<HealReport> {
        let completeness = self.detector.validate_completeness(&self.journal).await?;
        if completeness.is_complete() {
            self.notifier.info("Journal is complete, nothing to heal");
            return Ok(HealReport::default());
        }

        self.journal.set_auto_save(false);
        let healed = self
            .detector
            .heal_missing(&mut self.journal, &completeness.missing)
            .await;
        if let Ok(report) = &healed {
            self.enqueue_all(report.operations.clone()).await;
        }
        self.journal.set_auto_save(true);
        self.journal.force_save_if_dirty().await?;

        let healed = healed?;
        self.notifier.info(&format!(
            "Journal healed: {} tasks added, {} tombstoned",
            healed.added, healed.tombstoned
        ));
        Ok(healed)
    }

    /// Back up and wipe the journal so the next cycle rediscovers everything.
    pub async fn reset_journal(&mut self) -> Result<Option<String>> {
        let backup = match self.journal.create_backup("pre-reset").await {
            Ok(name) => Some(name),
            Err(e) => {
                warn!("Failed to back up journal before reset: {}", e);
                None
            }
        };
        self.journal.reset_journal().await?;
        self.notifier.info("Sync journal reset");
        Ok(backup)
    }
}
