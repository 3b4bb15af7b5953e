//! Journal document types.
//!
//! The journal is the persisted record of every linked task's last-known
//! state on both sides, plus the operation queues and statistics. It is
//! serialized as camelCase JSON and owned exclusively by
//! [`SyncJournalStore`](crate::store::SyncJournalStore).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version written into every saved journal.
pub const JOURNAL_VERSION: &str = "2.0.0";

/// One tracked linked task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLink {
    pub remote_id: String,
    /// Stable note identifier; empty for entries written before ids existed
    #[serde(default)]
    pub note_id: String,
    pub note_path: String,
    pub line_index: usize,
    pub local_completed: bool,
    pub remote_completed: bool,
    #[serde(default)]
    pub local_content_hash: String,
    #[serde(default)]
    pub remote_content_hash: String,
    #[serde(default)]
    pub last_local_check: u64,
    #[serde(default)]
    pub last_remote_check: u64,
    #[serde(default)]
    pub last_sync_operation: u64,
    #[serde(default)]
    pub remote_due_date: Option<NaiveDate>,
    #[serde(default)]
    pub discovered_at: u64,
    #[serde(default)]
    pub last_path_validation: Option<u64>,
}

/// Partial update applied through `SyncJournalStore::update_task`.
///
/// Only the `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct TaskLinkUpdate {
    pub note_id: Option<String>,
    pub note_path: Option<String>,
    pub line_index: Option<usize>,
    pub local_completed: Option<bool>,
    pub remote_completed: Option<bool>,
    pub local_content_hash: Option<String>,
    pub remote_content_hash: Option<String>,
    pub last_local_check: Option<u64>,
    pub last_remote_check: Option<u64>,
    pub last_sync_operation: Option<u64>,
    pub remote_due_date: Option<Option<NaiveDate>>,
    pub last_path_validation: Option<u64>,
}

impl TaskLinkUpdate {
    pub(crate) fn apply(self, link: &mut TaskLink) {
        if let Some(v) = self.note_id {
            link.note_id = v;
        }
        if let Some(v) = self.note_path {
            link.note_path = v;
        }
        if let Some(v) = self.line_index {
            link.line_index = v;
        }
        if let Some(v) = self.local_completed {
            link.local_completed = v;
        }
        if let Some(v) = self.remote_completed {
            link.remote_completed = v;
        }
        if let Some(v) = self.local_content_hash {
            link.local_content_hash = v;
        }
        if let Some(v) = self.remote_content_hash {
            link.remote_content_hash = v;
        }
        if let Some(v) = self.last_local_check {
            link.last_local_check = v;
        }
        if let Some(v) = self.last_remote_check {
            link.last_remote_check = v;
        }
        if let Some(v) = self.last_sync_operation {
            link.last_sync_operation = v;
        }
        if let Some(v) = self.remote_due_date {
            link.remote_due_date = v;
        }
        if let Some(v) = self.last_path_validation {
            link.last_path_validation = Some(v);
        }
    }
}

/// Why a task was tombstoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    /// Remote answered 404
    Deleted,
    /// Remote answered 403, or the id is absent from a bulk listing
    Inaccessible,
    /// The owning note is gone from the vault
    UserRemoved,
}

/// Tombstone for a task that must never be read from the remote again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedTaskLink {
    pub remote_id: String,
    pub reason: DeletionReason,
    #[serde(default)]
    pub http_status: Option<u16>,
    pub deleted_at: u64,
    #[serde(default)]
    pub last_known_path: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToRemote,
    RemoteToLocal,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::LocalToRemote => write!(f, "local→remote"),
            SyncDirection::RemoteToLocal => write!(f, "remote→local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

/// Unit of work produced by change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub direction: SyncDirection,
    /// Remote id of the task this operation applies to
    pub task_ref: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: u64,
    #[serde(default)]
    pub last_attempt_at: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Completion state the target side should end up in
    pub new_completion_state: bool,
    #[serde(default)]
    pub remote_completed_at: Option<DateTime<Utc>>,
    /// Local task line at detection time
    #[serde(default)]
    pub local_content: Option<String>,
}

impl SyncOperation {
    pub fn new(direction: SyncDirection, task_ref: &str, new_completion_state: bool, now: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            task_ref: task_ref.to_string(),
            status: OperationStatus::Pending,
            retry_count: 0,
            created_at: now,
            last_attempt_at: None,
            last_error: None,
            new_completion_state,
            remote_completed_at: None,
            local_content: None,
        }
    }

    pub fn with_remote_completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.remote_completed_at = at;
        self
    }

    pub fn with_local_content(mut self, line: &str) -> Self {
        self.local_content = Some(line.to_string());
        self
    }

    /// Same task, direction and target state as `other`.
    pub fn is_equivalent(&self, other: &SyncOperation) -> bool {
        self.task_ref == other.task_ref
            && self.direction == other.direction
            && self.new_completion_state == other.new_completion_state
    }
}

/// Running counters exposed to diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStats {
    pub total_syncs: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub tasks_tracked: usize,
    pub tasks_deleted: usize,
    pub new_tasks_last_sync: usize,
    pub last_sync_duration_ms: u64,
    pub last_sync_at: u64,
    pub api_calls_last_sync: u64,
    pub api_calls_total: u64,
    pub last_error: Option<String>,
}

/// Partial stats update; counters in `add_*` are added, the rest overwrite.
#[derive(Debug, Clone, Default)]
pub struct StatsUpdate {
    pub add_syncs: u64,
    pub add_successful_operations: u64,
    pub add_failed_operations: u64,
    pub new_tasks_last_sync: Option<usize>,
    pub last_sync_duration_ms: Option<u64>,
    pub last_sync_at: Option<u64>,
    pub api_calls_last_sync: Option<u64>,
    pub last_error: Option<Option<String>>,
}

/// The aggregate root persisted to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJournal {
    pub version: String,
    #[serde(default)]
    pub last_obsidian_scan: u64,
    #[serde(default)]
    pub last_todoist_sync: u64,
    #[serde(default)]
    pub last_sync_timestamp: u64,
    #[serde(default)]
    pub tasks: HashMap<String, TaskLink>,
    #[serde(default)]
    pub deleted_tasks: HashMap<String, DeletedTaskLink>,
    #[serde(default)]
    pub pending_operations: Vec<SyncOperation>,
    #[serde(default)]
    pub failed_operations: Vec<SyncOperation>,
    #[serde(default)]
    pub stats: SyncStats,
}

impl Default for SyncJournal {
    fn default() -> Self {
        Self {
            version: JOURNAL_VERSION.to_string(),
            last_obsidian_scan: 0,
            last_todoist_sync: 0,
            last_sync_timestamp: 0,
            tasks: HashMap::new(),
            deleted_tasks: HashMap::new(),
            pending_operations: Vec::new(),
            failed_operations: Vec::new(),
            stats: SyncStats::default(),
        }
    }
}
