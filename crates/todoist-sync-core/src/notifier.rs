//! User-facing notifications.
//!
//! The coordinator reports cycle phases and summaries through a
//! [`UserNotifier`] injected at construction. Full detail goes to `tracing`;
//! notifier messages are short summaries (counts, not stack traces).

use serde::Serialize;
use std::sync::Mutex;

/// Phases of a sync cycle, in order. Every cycle ends in `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Discovery,
    Operations,
    Retry,
    Complete,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::Discovery => "discovery",
            SyncPhase::Operations => "operations",
            SyncPhase::Retry => "retry",
            SyncPhase::Complete => "complete",
        };
        f.write_str(name)
    }
}

pub trait UserNotifier: Send + Sync {
    fn progress(&self, phase: SyncPhase, message: &str);

    fn info(&self, message: &str);

    fn error(&self, message: &str);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl UserNotifier for NullNotifier {
    fn progress(&self, _phase: SyncPhase, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    Progress { phase: SyncPhase, message: String },
    Info { message: String },
    Error { message: String },
}

/// Keeps every notification, for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn phases(&self) -> Vec<SyncPhase> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Progress { phase, .. } => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Error { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) {
        self.notifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

impl UserNotifier for RecordingNotifier {
    fn progress(&self, phase: SyncPhase, message: &str) {
        self.push(Notification::Progress {
            phase,
            message: message.to_string(),
        });
    }

    fn info(&self, message: &str) {
        self.push(Notification::Info {
            message: message.to_string(),
        });
    }

    fn error(&self, message: &str) {
        self.push(Notification::Error {
            message: message.to_string(),
        });
    }
}
