//! End-to-end tests for the sync cycle against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use todoist_sync_core::clock::MINUTE_MS;
use todoist_sync_core::remote::RemoteCall;
use todoist_sync_core::{
    DeletionReason, InMemoryJournalBackend, InMemoryNoteStore, InMemoryRemoteStore, ManualClock,
    ManualScheduler, RecordingNotifier, RemoteError, SyncCoordinator, SyncDirection,
    SyncJournalStore, SyncPhase, SyncService, SyncSettings,
};

const NOW: u64 = 1_700_000_000_000;

const BUY_MILK: &str = "- [ ] Buy milk\n    - [Todoist](https://todoist.com/showTask?id=abc123)\n";

struct Harness {
    notes: Arc<InMemoryNoteStore>,
    remote: Arc<InMemoryRemoteStore>,
    clock: Arc<ManualClock>,
    backend: Arc<InMemoryJournalBackend>,
    notifier: Arc<RecordingNotifier>,
    settings: SyncSettings,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    fn with_settings(settings: SyncSettings) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        Self {
            notes: Arc::new(InMemoryNoteStore::with_clock(clock.clone())),
            remote: Arc::new(InMemoryRemoteStore::new()),
            clock,
            backend: Arc::new(InMemoryJournalBackend::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            settings,
        }
    }

    /// A coordinator over this harness's stores, with the journal loaded.
    async fn coordinator(&self) -> SyncCoordinator {
        let mut coordinator = self.build();
        coordinator.initialize().await;
        coordinator
    }

    fn build(&self) -> SyncCoordinator {
        let journal = SyncJournalStore::new(self.backend.clone(), self.clock.clone());
        SyncCoordinator::new(
            journal,
            self.notes.clone(),
            self.remote.clone(),
            self.notifier.clone(),
            self.clock.clone(),
            self.settings.clone(),
        )
    }

    fn advance_minutes(&self, minutes: u64) {
        self.clock.advance(Duration::from_millis(minutes * MINUTE_MS));
    }

    fn closes(&self, id: &str) -> usize {
        self.remote
            .count(|call| matches!(call, RemoteCall::Close(i) if i == id))
    }
}

// ==================== Scenarios ====================

#[tokio::test]
async fn test_discovery_tracks_open_linked_task() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;

    let report = coordinator.perform_sync().await;

    assert_eq!(report.new_tasks, 1);
    assert_eq!(report.operations_completed, 0);
    let link = coordinator.journal().get_task("abc123").unwrap();
    assert!(!link.local_completed);
    assert!(!link.remote_completed);
    assert!(coordinator.journal().get_pending_operations().is_empty());
}

#[tokio::test]
async fn test_local_completion_closes_remote_once() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    h.advance_minutes(1);
    h.notes
        .insert("Groceries.md", &BUY_MILK.replace("- [ ] Buy", "- [x] Buy"));
    let report = coordinator.perform_sync().await;

    assert_eq!(report.operations_completed, 1);
    assert!(coordinator.journal().get_task("abc123").unwrap().remote_completed);
    assert!(h.remote.task("abc123").unwrap().completed);
    assert_eq!(h.closes("abc123"), 1);

    // Nothing left to do
    h.advance_minutes(1);
    let report = coordinator.perform_sync().await;
    assert_eq!(report.operations_completed, 0);
    assert_eq!(h.closes("abc123"), 1);
}

#[tokio::test]
async fn test_not_found_tombstones_and_stops_remote_reads() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    let mut coordinator = h.coordinator().await;

    let report = coordinator.perform_sync().await;

    assert_eq!(report.tombstoned, 1);
    let tombstone = coordinator.journal().get_deleted_task("abc123").unwrap();
    assert_eq!(tombstone.reason, DeletionReason::Deleted);
    assert_eq!(tombstone.http_status, Some(404));
    assert_eq!(tombstone.last_known_path.as_deref(), Some("Groceries.md"));

    h.remote.clear_calls();
    for _ in 0..3 {
        h.advance_minutes(60);
        coordinator.perform_sync().await;
    }
    assert_eq!(h.remote.calls_for("abc123"), 0);
}

#[tokio::test]
async fn test_bulk_heal_lists_once_for_fifty_missing_tasks() {
    let h = Harness::new();
    let mut note = String::new();
    for i in 0..50 {
        note.push_str(&format!(
            "- [ ] Task {i}\n    - https://todoist.com/showTask?id=t{i}\n"
        ));
        if i % 2 == 0 {
            h.remote.insert_open(&format!("t{i}"), &format!("Task {i}"));
        }
    }
    h.notes.insert("Backlog.md", &note);
    let mut coordinator = h.coordinator().await;

    let healed = coordinator.heal_journal().await.unwrap();

    assert_eq!(h.remote.calls(), vec![RemoteCall::List]);
    assert_eq!(healed.added, 25);
    assert_eq!(healed.tombstoned, 25);
    assert!(coordinator.journal().is_tracked("t0"));
    assert_eq!(
        coordinator.journal().get_deleted_task("t1").unwrap().reason,
        DeletionReason::Inaccessible
    );
    assert_eq!(coordinator.journal().task_count(), 25);
    assert_eq!(coordinator.journal().deleted_count(), 25);
    assert!(h.backend.backups().iter().any(|(name, _)| name.starts_with("pre-heal")));
}

// ==================== Properties ====================

#[tokio::test]
async fn test_second_cycle_is_idempotent() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let completed_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    h.remote.set_completed("abc123", true, Some(completed_at));
    let mut coordinator = h.coordinator().await;

    let first = coordinator.perform_sync().await;
    assert_eq!(first.operations_completed, 1);
    assert_eq!(h.notes.write_count("Groceries.md"), 1);
    let content = h.notes.content("Groceries.md").unwrap();
    assert!(content.starts_with("- [x] Buy milk ✅ 2024-05-0"));
    assert!(content.ends_with('\n'));

    h.advance_minutes(1);
    let second = coordinator.perform_sync().await;

    assert_eq!(second.operations_completed, 0);
    assert_eq!(second.operations_failed, 0);
    assert!(coordinator.journal().get_pending_operations().is_empty());
    assert_eq!(h.notes.write_count("Groceries.md"), 1);
}

#[tokio::test]
async fn test_completion_timestamp_can_be_disabled() {
    let mut settings = SyncSettings::default();
    settings.add_completion_timestamp = false;
    let h = Harness::with_settings(settings);
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    h.remote.set_completed("abc123", true, None);
    let mut coordinator = h.coordinator().await;

    coordinator.perform_sync().await;

    assert_eq!(
        h.notes.content("Groceries.md").unwrap(),
        BUY_MILK.replace("- [ ] Buy", "- [x] Buy")
    );
}

#[tokio::test]
async fn test_remote_reopen_reopens_local_task() {
    let mut settings = SyncSettings::default();
    settings.track_completed_tasks = true;
    let h = Harness::with_settings(settings);
    h.notes
        .insert("Groceries.md", &BUY_MILK.replace("- [ ] Buy", "- [x] Buy"));
    h.remote.insert_open("abc123", "Buy milk");
    h.remote.set_completed("abc123", true, None);
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    // Completed on both sides, so only the daily re-check notices the reopen
    h.remote.set_completed("abc123", false, None);
    h.advance_minutes(25 * 60);
    let report = coordinator.perform_sync().await;

    assert_eq!(report.operations_completed, 1);
    assert!(h.notes.content("Groceries.md").unwrap().starts_with("- [ ] Buy milk"));
    assert!(!coordinator.journal().get_task("abc123").unwrap().local_completed);
}

#[tokio::test]
async fn test_path_self_heals_through_note_id() {
    let h = Harness::new();
    h.notes.insert("Inbox.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    h.coordinator().await.perform_sync().await;

    h.notes.rename("Inbox.md", "Archive/Inbox.md");
    let mut coordinator = h.build();
    let init = coordinator.initialize().await;

    assert_eq!(init.paths_corrected, 1);
    assert_eq!(init.tombstoned, 0);
    let link = coordinator.journal().get_task("abc123").unwrap();
    assert_eq!(link.note_path, "Archive/Inbox.md");
    assert!(!coordinator.journal().is_deleted("abc123"));
}

#[tokio::test]
async fn test_removed_note_is_tombstoned_on_start() {
    let h = Harness::new();
    h.notes.insert("Inbox.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    h.coordinator().await.perform_sync().await;

    h.notes.delete("Inbox.md");
    let mut coordinator = h.build();
    let init = coordinator.initialize().await;

    assert_eq!(init.tombstoned, 1);
    assert_eq!(
        coordinator.journal().get_deleted_task("abc123").unwrap().reason,
        DeletionReason::UserRemoved
    );
}

#[tokio::test]
async fn test_legacy_entries_get_note_ids() {
    let h = Harness::new();
    h.notes.insert("Inbox.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    h.coordinator().await.perform_sync().await;

    let legacy = h.backend.contents().unwrap().replace("\"noteId\": \"note-1\"", "\"noteId\": \"\"");
    let backend = Arc::new(InMemoryJournalBackend::with_contents(&legacy));
    let h = Harness { backend, ..h };
    let mut coordinator = h.build();

    let init = coordinator.initialize().await;

    assert_eq!(init.note_ids_assigned, 1);
    assert_eq!(coordinator.journal().get_task("abc123").unwrap().note_id, "note-1");
}

// ==================== Failures and retries ====================

#[tokio::test]
async fn test_failed_operation_waits_for_backoff() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    h.notes
        .insert("Groceries.md", &BUY_MILK.replace("- [ ] Buy", "- [x] Buy"));
    h.remote
        .fail_next_write("abc123", RemoteError::Network("connection reset".into()));
    h.advance_minutes(1);
    let report = coordinator.perform_sync().await;

    assert_eq!(report.operations_failed, 1);
    let failed = coordinator.journal().get_failed_operations();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 1);
    assert_eq!(failed[0].direction, SyncDirection::LocalToRemote);
    assert_eq!(h.notifier.errors().len(), 1);

    // Inside the one minute window: not retried, not queued twice
    h.clock.advance(Duration::from_secs(30));
    let report = coordinator.perform_sync().await;
    assert_eq!(report.retried, 0);
    assert_eq!(h.closes("abc123"), 1);
    assert!(coordinator.journal().get_pending_operations().is_empty());

    h.clock.advance(Duration::from_secs(31));
    let report = coordinator.perform_sync().await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.operations_completed, 1);
    assert!(coordinator.journal().get_failed_operations().is_empty());
    assert!(h.remote.task("abc123").unwrap().completed);
}

#[tokio::test]
async fn test_not_found_during_execution_tombstones() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    h.notes
        .insert("Groceries.md", &BUY_MILK.replace("- [ ] Buy", "- [x] Buy"));
    h.remote
        .fail_next_write("abc123", RemoteError::NotFound("abc123".into()));
    h.advance_minutes(1);
    let report = coordinator.perform_sync().await;

    assert_eq!(report.operations_dropped, 1);
    assert!(coordinator.journal().is_deleted("abc123"));
    assert!(coordinator.journal().get_failed_operations().is_empty());
}

#[tokio::test]
async fn test_rate_limited_discovery_is_retried_not_tombstoned() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    h.remote
        .fail_next("abc123", RemoteError::RateLimited { retry_after: None });
    let mut coordinator = h.coordinator().await;

    let report = coordinator.perform_sync().await;

    assert_eq!(report.new_tasks, 1);
    assert!(!coordinator.journal().is_deleted("abc123"));
    assert_eq!(h.remote.calls_for("abc123"), 2);
}

#[tokio::test]
async fn test_cycle_reports_phases_in_order() {
    let h = Harness::new();
    let mut coordinator = h.coordinator().await;

    coordinator.perform_sync().await;

    assert_eq!(
        h.notifier.phases(),
        vec![
            SyncPhase::Discovery,
            SyncPhase::Operations,
            SyncPhase::Retry,
            SyncPhase::Complete
        ]
    );
    assert!(h.notifier.errors().is_empty());
    assert_eq!(coordinator.stats().total_syncs, 1);
}

#[tokio::test]
async fn test_stats_count_api_calls() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;

    let report = coordinator.perform_sync().await;

    assert_eq!(report.api_calls, 1);
    let stats = coordinator.stats();
    assert_eq!(stats.api_calls_last_sync, 1);
    assert_eq!(stats.tasks_tracked, 1);
    assert_eq!(stats.new_tasks_last_sync, 1);
    assert_eq!(stats.last_error, None);
}

// ==================== Manual commands ====================

#[tokio::test]
async fn test_sync_file_discovers_when_journal_is_empty() {
    let h = Harness::new();
    h.notes.insert(
        "Inbox.md",
        "- [x] Call mom https://todoist.com/showTask?id=mom1\n- [ ] Pay rent https://todoist.com/showTask?id=rent1\n",
    );
    h.remote.insert_open("mom1", "Call mom");
    h.remote.insert_open("rent1", "Pay rent");
    let mut coordinator = h.coordinator().await;

    let report = coordinator.sync_file("Inbox.md").await.unwrap();

    assert_eq!(report.new_tasks, 2);
    assert_eq!(report.operations_completed, 1);
    assert!(h.remote.task("mom1").unwrap().completed);
    assert!(!h.remote.task("rent1").unwrap().completed);
    assert_eq!(coordinator.journal().task_count(), 2);
}

#[tokio::test]
async fn test_sync_task_falls_back_to_note() {
    let h = Harness::new();
    h.notes
        .insert("Inbox.md", "# Today\n- [x] Call mom https://todoist.com/showTask?id=mom1\n");
    h.remote.insert_open("mom1", "Call mom");
    let mut coordinator = h.coordinator().await;

    let report = coordinator.sync_task("mom1", "Inbox.md", 1).await.unwrap();

    assert_eq!(report.operations_completed, 1);
    assert!(h.remote.task("mom1").unwrap().completed);
    assert!(coordinator.journal().is_tracked("mom1"));

    assert!(coordinator.sync_task("nope", "Inbox.md", 0).await.is_err());
}

#[tokio::test]
async fn test_sync_task_refuses_tombstoned_task() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;
    h.remote.clear_calls();

    assert!(coordinator.sync_task("abc123", "Groceries.md", 0).await.is_err());
    assert_eq!(h.remote.calls_for("abc123"), 0);
}

#[tokio::test]
async fn test_sync_vault_bypasses_check_interval() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    // Checked moments ago, so a periodic cycle would not look
    h.remote.set_completed("abc123", true, None);
    h.clock.advance(Duration::from_secs(1));
    let periodic = coordinator.perform_sync().await;
    assert_eq!(periodic.operations_completed, 0);

    let manual = coordinator.sync_vault().await.unwrap();

    assert_eq!(manual.operations_completed, 1);
    assert!(h.notes.content("Groceries.md").unwrap().starts_with("- [x] Buy milk"));
}

#[tokio::test]
async fn test_sync_vault_honors_time_window() {
    let h = Harness::with_settings(SyncSettings {
        time_window_enabled: true,
        time_window_days: 7,
        ..SyncSettings::default()
    });
    h.notes.insert(
        "Inbox.md",
        "- [ ] Old https://todoist.com/showTask?id=old1\n- [ ] Fresh https://todoist.com/showTask?id=new1\n",
    );
    h.remote.insert_open("old1", "Old");
    h.remote.insert_open("new1", "Fresh");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    // Completing old1 gives it a sync operation timestamp
    h.advance_minutes(1);
    h.notes.insert(
        "Inbox.md",
        "- [x] Old https://todoist.com/showTask?id=old1\n- [ ] Fresh https://todoist.com/showTask?id=new1\n",
    );
    coordinator.perform_sync().await;
    assert!(coordinator.journal().get_task("old1").unwrap().last_sync_operation > 0);
    assert_eq!(coordinator.journal().get_task("new1").unwrap().last_sync_operation, 0);

    h.advance_minutes(8 * 24 * 60);
    h.remote.clear_calls();
    coordinator.sync_vault().await.unwrap();

    assert_eq!(h.remote.calls_for("old1"), 0);
    assert_eq!(h.remote.calls_for("new1"), 1);
}

#[tokio::test]
async fn test_parent_task_does_not_take_child_link() {
    let h = Harness::new();
    h.notes.insert(
        "Project.md",
        "- [ ] Parent\n    - [ ] Child https://todoist.com/showTask?id=child1\n",
    );
    h.remote.insert_open("child1", "Child");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;
    assert_eq!(coordinator.journal().get_task("child1").unwrap().line_index, 1);

    h.advance_minutes(1);
    h.notes.insert(
        "Project.md",
        "- [x] Parent\n    - [ ] Child https://todoist.com/showTask?id=child1\n",
    );
    coordinator.perform_sync().await;
    assert_eq!(h.closes("child1"), 0);
    assert!(!h.remote.task("child1").unwrap().completed);

    h.advance_minutes(1);
    h.notes.insert(
        "Project.md",
        "- [x] Parent\n    - [x] Child https://todoist.com/showTask?id=child1\n",
    );
    coordinator.perform_sync().await;
    assert_eq!(h.closes("child1"), 1);
}

#[tokio::test]
async fn test_local_rewrite_keeps_crlf_line_endings() {
    let h = Harness::with_settings(SyncSettings {
        add_completion_timestamp: false,
        ..SyncSettings::default()
    });
    h.notes.insert(
        "Windows.md",
        "# Title\r\n- [ ] Buy https://todoist.com/showTask?id=abc\r\nother line\r\n",
    );
    h.remote.insert_open("abc", "Buy");
    h.remote.set_completed("abc", true, None);
    let mut coordinator = h.coordinator().await;

    let report = coordinator.perform_sync().await;

    assert_eq!(report.operations_completed, 1);
    assert_eq!(
        h.notes.content("Windows.md").unwrap(),
        "# Title\r\n- [x] Buy https://todoist.com/showTask?id=abc\r\nother line\r\n"
    );
}

#[tokio::test]
async fn test_reset_journal_backs_up_first() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = h.coordinator().await;
    coordinator.perform_sync().await;

    let backup = coordinator.reset_journal().await.unwrap();

    assert!(backup.unwrap().starts_with("pre-reset"));
    assert_eq!(coordinator.journal().task_count(), 0);
    assert!(h.backend.backups()[0].1.contains("abc123"));
}

// ==================== Service ====================

#[tokio::test]
async fn test_service_start_is_idempotent_and_ticks() {
    let h = Harness::new();
    h.notes.insert("Groceries.md", BUY_MILK);
    h.remote.insert_open("abc123", "Buy milk");
    let scheduler = Arc::new(ManualScheduler::new());
    let mut service = SyncService::new(h.build(), scheduler.clone());

    let (_, first) = service.start().await.unwrap();
    assert_eq!(first.new_tasks, 1);
    assert!(service.start().await.is_none());
    assert_eq!(scheduler.periods(), vec![Duration::from_secs(300)]);

    scheduler.fire().await;
    assert_eq!(service.stats().await.total_syncs, 2);

    // A tick that fires while a cycle holds the coordinator is skipped
    {
        let coordinator = service.coordinator();
        let _busy = coordinator.lock().await;
        scheduler.fire().await;
    }
    assert_eq!(service.stats().await.total_syncs, 2);

    service.stop().await;
    service.stop().await;
    assert!(!service.is_running());
    scheduler.fire().await;
    assert_eq!(service.stats().await.total_syncs, 2);
}
