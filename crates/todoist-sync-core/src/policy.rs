//! Five-category prioritization of remote checks.
//!
//! | Category | Condition | Policy |
//! |---|---|---|
//! | 1 | local done, remote open | always check now |
//! | 2 | local open, remote done | always check now |
//! | 3 | both open | normal interval |
//! | 4 | both done | only when opted in, then rarely |
//! | 5 | tombstoned | never |
//!
//! Tombstoned tasks never reach this module: the journal removes them from the
//! live set, so [`TaskCategory::Tombstoned`] only comes out of [`classify`]
//! when the caller passes `tombstoned = true`.

use crate::journal::TaskLink;
use crate::settings::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    LocalDoneRemoteOpen,
    LocalOpenRemoteDone,
    BothOpen,
    BothDone,
    Tombstoned,
}

impl TaskCategory {
    /// The two sides disagree and must be reconciled this cycle.
    pub fn is_divergent(self) -> bool {
        matches!(
            self,
            TaskCategory::LocalDoneRemoteOpen | TaskCategory::LocalOpenRemoteDone
        )
    }
}

pub fn classify(local_completed: bool, remote_completed: bool, tombstoned: bool) -> TaskCategory {
    if tombstoned {
        return TaskCategory::Tombstoned;
    }
    match (local_completed, remote_completed) {
        (true, false) => TaskCategory::LocalDoneRemoteOpen,
        (false, true) => TaskCategory::LocalOpenRemoteDone,
        (false, false) => TaskCategory::BothOpen,
        (true, true) => TaskCategory::BothDone,
    }
}

/// Decide whether a live task is worth a remote call this cycle.
pub fn should_check_remote_now(link: &TaskLink, settings: &SyncSettings, now: u64) -> bool {
    let category = classify(link.local_completed, link.remote_completed, false);
    if category.is_divergent() {
        return true;
    }

    let since_check = now.saturating_sub(link.last_remote_check);
    if link.last_remote_check != 0 && since_check < settings.sync_interval_ms() {
        return false;
    }

    if category == TaskCategory::BothDone {
        return settings.track_completed_tasks
            && (link.last_remote_check == 0
                || since_check >= settings.completed_recheck_interval_ms());
    }

    if has_upcoming_due_date(link, now) {
        return true;
    }

    if link.last_remote_check == 0 || since_check > settings.stale_after_ms() {
        return true;
    }

    settings.time_window_enabled && within_time_window(link, settings, now)
}

/// A due date after today means the task might still be completed remotely.
fn has_upcoming_due_date(link: &TaskLink, now: u64) -> bool {
    let Some(due) = link.remote_due_date else {
        return false;
    };
    let Some(today) = chrono::DateTime::from_timestamp_millis(now as i64) else {
        return false;
    };
    due > today.date_naive()
}

/// Tasks never synced are always inside the window.
pub fn within_time_window(link: &TaskLink, settings: &SyncSettings, now: u64) -> bool {
    link.last_sync_operation == 0
        || now.saturating_sub(link.last_sync_operation) <= settings.time_window_ms()
}
