//! Retry backoff for failed sync operations.

use crate::clock::MINUTE_MS;
use crate::journal::SyncOperation;
use std::time::Duration;

/// Delay before retry N (1-based), in minutes. Clamped to the last entry.
pub const BACKOFF_MINUTES: [u64; 6] = [1, 5, 15, 60, 360, 1440];

/// Delay required after a failure with the given retry count.
pub fn calculate_backoff(retry_count: u32) -> Duration {
    let index = (retry_count.max(1) as usize - 1).min(BACKOFF_MINUTES.len() - 1);
    Duration::from_millis(BACKOFF_MINUTES[index] * MINUTE_MS)
}

/// Earliest time a failed operation may run again (ms since epoch).
pub fn next_retry_at(op: &SyncOperation) -> u64 {
    let last_attempt = op.last_attempt_at.unwrap_or(op.created_at);
    last_attempt + calculate_backoff(op.retry_count).as_millis() as u64
}

/// Whether a failed operation's backoff window has elapsed.
pub fn is_retry_due(op: &SyncOperation, now: u64) -> bool {
    now >= next_retry_at(op)
}
