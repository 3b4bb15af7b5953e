//! End-to-end tests for todoist-sync-daemon.
//!
//! Runs real sync cycles over a vault directory and a file-backed journal,
//! with the remote side in memory.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use todoist_sync_core::remote::RemoteCall;
use todoist_sync_core::{
    DeletionReason, InMemoryRemoteStore, ManualScheduler, NullNotifier, SyncCoordinator,
    SyncService, SyncSettings,
};
use todoist_sync_daemon::persistence::JOURNAL_FILE;
use todoist_sync_daemon::{DaemonConfig, build_coordinator};

struct TestVault {
    dir: TempDir,
    config: DaemonConfig,
    remote: Arc<InMemoryRemoteStore>,
}

impl TestVault {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let vault = dir.path().to_string_lossy().to_string();
        let config = DaemonConfig::from_lookup(|key| match key {
            "OBSIDIAN_VAULT_PATH" => Some(vault.clone()),
            "TODOIST_API_TOKEN" => Some("test-token".to_string()),
            _ => None,
        })
        .unwrap();
        Self {
            dir,
            config,
            remote: Arc::new(InMemoryRemoteStore::new()),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, content: &str) {
        let full = self.path().join(rel);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path().join(rel)).unwrap()
    }

    fn journal(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.config.data_dir.join(JOURNAL_FILE)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    async fn coordinator(&self) -> SyncCoordinator {
        let mut coordinator = build_coordinator(
            &self.config,
            SyncSettings::default(),
            self.remote.clone(),
            Arc::new(NullNotifier),
        );
        coordinator.initialize().await;
        coordinator
    }
}

const GROCERIES: &str = "---\nid: groceries\n---\n# Groceries\n\n- [ ] Buy milk\n    - [Todoist](https://todoist.com/showTask?id=abc123)\n- [ ] Buy eggs\n";

#[tokio::test]
async fn test_first_cycle_persists_journal() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");

    let report = vault.coordinator().await.perform_sync().await;

    assert_eq!(report.new_tasks, 1);
    let journal = vault.journal();
    assert_eq!(journal["version"], "2.0.0");
    let link = &journal["tasks"]["abc123"];
    assert_eq!(link["notePath"], "Groceries.md");
    assert_eq!(link["noteId"], "groceries");
    assert_eq!(link["lineIndex"], 5);
    assert_eq!(link["localCompleted"], false);
    assert!(journal["lastObsidianScan"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_local_completion_reaches_remote() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");
    let mut coordinator = vault.coordinator().await;
    coordinator.perform_sync().await;

    vault.write("Groceries.md", &GROCERIES.replace("- [ ] Buy milk", "- [x] Buy milk"));
    let report = coordinator.perform_sync().await;

    assert_eq!(report.operations_completed, 1);
    assert!(vault.remote.task("abc123").unwrap().completed);
    assert_eq!(vault.journal()["tasks"]["abc123"]["remoteCompleted"], true);
    assert_eq!(vault.journal()["pendingOperations"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_remote_completion_rewrites_only_the_task_line() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");
    vault.remote.set_completed("abc123", true, None);

    vault.coordinator().await.perform_sync().await;

    let content = vault.read("Groceries.md");
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines[5].starts_with("- [x] Buy milk ✅ "));
    assert_eq!(lines[6], "    - [Todoist](https://todoist.com/showTask?id=abc123)");
    assert_eq!(lines[7], "- [ ] Buy eggs");
    assert!(content.starts_with("---\nid: groceries\n---\n"));
    assert!(content.ends_with('\n'));
}

#[tokio::test]
async fn test_restart_keeps_tombstones() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.coordinator().await.perform_sync().await;
    assert_eq!(vault.journal()["deletedTasks"]["abc123"]["reason"], "deleted");

    vault.remote.clear_calls();
    let mut coordinator = vault.coordinator().await;
    coordinator.perform_sync().await;

    assert!(coordinator.journal().is_deleted("abc123"));
    assert_eq!(vault.remote.calls_for("abc123"), 0);
}

#[tokio::test]
async fn test_moved_note_is_found_on_restart() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");
    vault.coordinator().await.perform_sync().await;

    std::fs::create_dir_all(vault.path().join("Archive/2024")).unwrap();
    std::fs::rename(
        vault.path().join("Groceries.md"),
        vault.path().join("Archive/2024/Groceries.md"),
    )
    .unwrap();
    let mut coordinator = vault.coordinator().await;

    let link = coordinator.journal().get_task("abc123").unwrap();
    assert_eq!(link.note_path, "Archive/2024/Groceries.md");
    assert!(link.last_path_validation.is_some());

    vault.remote.set_completed("abc123", true, None);
    let report = coordinator.sync_file("Archive/2024/Groceries.md").await.unwrap();
    assert_eq!(report.operations_completed, 1);
    assert!(vault.read("Archive/2024/Groceries.md").contains("- [x] Buy milk"));
}

#[tokio::test]
async fn test_deleted_note_is_tombstoned_on_restart() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");
    vault.coordinator().await.perform_sync().await;

    std::fs::remove_file(vault.path().join("Groceries.md")).unwrap();
    let coordinator = vault.coordinator().await;

    let tombstone = coordinator.journal().get_deleted_task("abc123").unwrap();
    assert_eq!(tombstone.reason, DeletionReason::UserRemoved);
    assert_eq!(tombstone.last_known_path.as_deref(), Some("Groceries.md"));
}

#[tokio::test]
async fn test_corrupt_journal_starts_over_with_backup() {
    let vault = TestVault::new();
    std::fs::create_dir_all(&vault.config.data_dir).unwrap();
    std::fs::write(vault.config.data_dir.join(JOURNAL_FILE), "{ not json").unwrap();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");

    let report = vault.coordinator().await.perform_sync().await;

    assert_eq!(report.new_tasks, 1);
    let backups: Vec<String> = std::fs::read_dir(&vault.config.data_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("sync-journal.corrupt."))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(
        std::fs::read_to_string(vault.config.data_dir.join(&backups[0])).unwrap(),
        "{ not json"
    );
}

#[tokio::test]
async fn test_heal_writes_backup_and_lists_once() {
    let vault = TestVault::new();
    vault.write(
        "Inbox.md",
        "- [ ] One https://todoist.com/showTask?id=t1\n- [x] Two https://todoist.com/showTask?id=t2\n- [ ] Three https://todoist.com/showTask?id=t3\n",
    );
    vault.remote.insert_open("t1", "One");
    vault.remote.insert_open("t2", "Two");
    let mut coordinator = vault.coordinator().await;

    let healed = coordinator.heal_journal().await.unwrap();

    assert_eq!(vault.remote.calls(), vec![RemoteCall::List]);
    assert_eq!(healed.added, 2);
    assert_eq!(healed.tombstoned, 1);
    assert_eq!(healed.operations.len(), 1);
    let backup = healed.backup.unwrap();
    assert!(vault.config.data_dir.join(backup).exists());
}

#[tokio::test]
async fn test_service_stop_flushes_journal() {
    let vault = TestVault::new();
    vault.write("Groceries.md", GROCERIES);
    vault.remote.insert_open("abc123", "Buy milk");
    let coordinator = build_coordinator(
        &vault.config,
        SyncSettings::default(),
        vault.remote.clone(),
        Arc::new(NullNotifier),
    );
    let scheduler = Arc::new(ManualScheduler::new());
    let mut service = SyncService::new(coordinator, scheduler.clone());

    assert!(service.start().await.is_some());
    scheduler.fire().await;
    service.stop().await;

    assert_eq!(vault.journal()["stats"]["totalSyncs"], 2);
    assert_eq!(scheduler.active_count(), 0);
}
