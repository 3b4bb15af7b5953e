//! SyncService: start/stop lifecycle around a shared [`SyncCoordinator`].
//!
//! Periodic ticks use `try_lock`, so a tick that fires while a cycle is still
//! running is skipped instead of queued. Manual commands wait for the lock.

use crate::coordinator::{InitReport, SyncCoordinator, SyncReport};
use crate::detector::HealReport;
use crate::error::Result;
use crate::journal::SyncStats;
use crate::scheduler::{CancelHandle, Scheduler, Tick};

use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub struct SyncService {
    coordinator: Arc<Mutex<SyncCoordinator>>,
    scheduler: Arc<dyn Scheduler>,
    interval: Duration,
    timer: Option<CancelHandle>,
}

impl SyncService {
    pub fn new(coordinator: SyncCoordinator, scheduler: Arc<dyn Scheduler>) -> Self {
        let interval = coordinator.settings().sync_interval();
        Self {
            coordinator: Arc::new(Mutex::new(coordinator)),
            scheduler,
            interval,
            timer: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Shared handle to the coordinator.
    pub fn coordinator(&self) -> Arc<Mutex<SyncCoordinator>> {
        Arc::clone(&self.coordinator)
    }

    /// Initialize the journal, run one cycle and schedule the rest.
    ///
    /// Returns `None` if the service was already running.
    pub async fn start(&mut self) -> Option<(InitReport, SyncReport)> {
        if self.is_running() {
            debug!("Sync service already running");
            return None;
        }

        let (init, first) = {
            let mut coordinator = self.coordinator.lock().await;
            let init = coordinator.initialize().await;
            let first = coordinator.perform_sync().await;
            (init, first)
        };

        let coordinator = Arc::clone(&self.coordinator);
        let tick: Tick = Arc::new(move || {
            let coordinator = Arc::clone(&coordinator);
            async move {
                match coordinator.try_lock() {
                    Ok(mut coordinator) => {
                        coordinator.perform_sync().await;
                    }
                    Err(_) => debug!("Sync cycle still running, skipping tick"),
                }
            }
            .boxed()
        });
        self.timer = Some(self.scheduler.schedule_every(self.interval, tick));
        info!("Sync service started, syncing every {:?}", self.interval);
        Some((init, first))
    }

    /// Cancel the timer and flush the journal. A cycle in flight finishes first.
    pub async fn stop(&mut self) {
        let Some(mut timer) = self.timer.take() else {
            return;
        };
        timer.cancel();
        if let Err(e) = self.coordinator.lock().await.flush().await {
            error!("Failed to save sync journal on shutdown: {}", e);
        }
        info!("Sync service stopped");
    }

    pub async fn sync_now(&self) -> SyncReport {
        self.coordinator.lock().await.perform_sync().await
    }

    pub async fn sync_task(&self, remote_id: &str, path: &str, line_index: usize) -> Result<SyncReport> {
        self.coordinator
            .lock()
            .await
            .sync_task(remote_id, path, line_index)
            .await
    }

    pub async fn sync_file(&self, path: &str) -> Result<SyncReport> {
        self.coordinator.lock().await.sync_file(path).await
    }

    pub async fn sync_vault(&self) -> Result<SyncReport> {
        self.coordinator.lock().await.sync_vault().await
    }

    pub async fn heal_journal(&self) -> Result<HealReport> {
        self.coordinator.lock().await.heal_journal().await
    }

    pub async fn reset_journal(&self) -> Result<Option<String>> {
        self.coordinator.lock().await.reset_journal().await
    }

    pub async fn stats(&self) -> SyncStats {
        self.coordinator.lock().await.stats()
    }
}
