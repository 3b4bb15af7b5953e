//! Sync settings snapshot.
//!
//! Passed into the detector and coordinator at construction time. Every field
//! has a default so a partial settings document deserializes cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where the completion timestamp appended to a local task comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Use the time the remote task was completed, falling back to now
    #[default]
    Remote,
    /// Always use the time the local line is rewritten
    Now,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Interval between periodic sync cycles and minimum spacing of remote checks
    pub sync_interval_secs: u64,
    /// Re-check tasks completed on both sides (category 4)
    pub track_completed_tasks: bool,
    /// How often category 4 tasks are re-checked when tracking is enabled
    pub completed_recheck_interval_secs: u64,
    /// A remote check older than `stale_multiplier * sync_interval` is forced
    pub stale_multiplier: u32,
    /// Restrict time-sensitive checks and vault-wide manual sync to recent tasks
    pub time_window_enabled: bool,
    pub time_window_days: u32,
    /// Fall back to a full vault scan when the scan watermark is older than this
    pub full_scan_after_secs: u64,
    /// Fall back to a full vault scan while fewer tasks than this are tracked
    pub min_tracked_for_incremental: usize,
    /// Append a completion timestamp when completing a task locally
    pub add_completion_timestamp: bool,
    /// chrono format string for the completion timestamp
    pub completion_timestamp_format: String,
    pub completion_timestamp_source: TimestampSource,
    /// Attempts made for a rate-limited remote read before giving up this cycle
    pub rate_limit_retries: u32,
    /// Base delay between rate-limited attempts, doubled per attempt
    pub rate_limit_backoff_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: 300,
            track_completed_tasks: false,
            completed_recheck_interval_secs: 24 * 60 * 60,
            stale_multiplier: 4,
            time_window_enabled: false,
            time_window_days: 7,
            full_scan_after_secs: 24 * 60 * 60,
            min_tracked_for_incremental: 5,
            add_completion_timestamp: true,
            completion_timestamp_format: "✅ %Y-%m-%d".to_string(),
            completion_timestamp_source: TimestampSource::Remote,
            rate_limit_retries: 3,
            rate_limit_backoff_ms: 2_000,
        }
    }
}

impl SyncSettings {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_interval_ms(&self) -> u64 {
        self.sync_interval_secs.saturating_mul(1000)
    }

    pub fn completed_recheck_interval_ms(&self) -> u64 {
        self.completed_recheck_interval_secs.saturating_mul(1000)
    }

    pub fn stale_after_ms(&self) -> u64 {
        self.sync_interval_ms()
            .saturating_mul(u64::from(self.stale_multiplier))
    }

    pub fn time_window_ms(&self) -> u64 {
        u64::from(self.time_window_days).saturating_mul(crate::clock::DAY_MS)
    }

    pub fn full_scan_after_ms(&self) -> u64 {
        self.full_scan_after_secs.saturating_mul(1000)
    }

    /// Delay before rate-limited attempt `attempt` (1-based).
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.rate_limit_backoff_ms.saturating_mul(factor))
    }
}
