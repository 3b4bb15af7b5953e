//! Tokio interval scheduler.

use std::time::Duration;
use todoist_sync_core::scheduler::{CancelHandle, Scheduler, Tick};
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;

/// Runs each schedule on its own tokio task. The first tick fires one period
/// after scheduling. Cancelling stops the task after the tick in progress,
/// if any, completes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_every(&self, period: Duration, tick: Tick) -> CancelHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("Scheduled task every {:?} stopped", period);
        });

        CancelHandle::new(move || {
            let _ = cancel_tx.send(());
        })
    }
}
