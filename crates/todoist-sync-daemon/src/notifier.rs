//! Notifier that reports through tracing.
//!
//! The headless daemon has no UI; progress goes to `debug`, summaries to
//! `info` and cycle errors to `error`, all under the `todoist_sync::notice`
//! target so they can be filtered separately with `RUST_LOG`.

use todoist_sync_core::notifier::{SyncPhase, UserNotifier};
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl UserNotifier for TracingNotifier {
    fn progress(&self, phase: SyncPhase, message: &str) {
        debug!(target: "todoist_sync::notice", %phase, "{}", message);
    }

    fn info(&self, message: &str) {
        info!(target: "todoist_sync::notice", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "todoist_sync::notice", "{}", message);
    }
}
